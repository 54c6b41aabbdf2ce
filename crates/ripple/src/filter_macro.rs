//! Macros for reducing filter boilerplate.

/// Build a [`ChangeKinds`](crate::ChangeKinds) set from change kind names.
///
/// # Example
///
/// ```ignore
/// use ripple_core::{change_kinds, FilterSpec};
///
/// let filter = FilterSpec::attribute("tags")
///     .change_kinds(change_kinds![NewItemInCollection, ChangedItemInCollection]);
/// ```
#[macro_export]
macro_rules! change_kinds {
    ($($kind:ident),* $(,)?) => {
        $crate::ChangeKinds::new()$(.with($crate::ChangeKind::$kind))*
    };
}
