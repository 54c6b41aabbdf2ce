//! Type matching against record images.
//!
//! A handler names the records it cares about either with a predicate over
//! the image (a discriminator) or with a schema the image must parse into
//! (a validator). The variant is fixed at registration so dispatch never
//! has to inspect the matcher's shape again.

use crate::value::Value;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type Parse = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub enum Matcher {
    /// Accepts every record, including ones without an image.
    Any,
    Discriminator(Predicate),
    Validator { schema: &'static str, parse: Parse },
}

impl Matcher {
    pub fn any() -> Self {
        Matcher::Any
    }

    pub fn discriminator<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Matcher::Discriminator(Arc::new(predicate))
    }

    /// Match images that deserialize into `T`.
    pub fn schema<T: DeserializeOwned + 'static>() -> Self {
        Matcher::Validator {
            schema: std::any::type_name::<T>(),
            parse: Arc::new(|value: &Value| {
                serde_json::from_value::<T>(value.to_json())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        }
    }

    /// Match images accepted by a custom parse function.
    pub fn validator<F>(schema: &'static str, parse: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Matcher::Validator {
            schema,
            parse: Arc::new(parse),
        }
    }

    /// Match images whose `attribute` equals `expected`, the common
    /// single-table `type` field discriminator.
    pub fn field_equals(attribute: impl Into<String>, expected: impl Into<Value>) -> Self {
        let attribute = attribute.into();
        let expected = expected.into();
        Matcher::discriminator(move |image| image.get_path(&attribute) == Some(&expected))
    }

    /// Whether `image` satisfies the matcher. Only [`Matcher::Any`] accepts
    /// a missing image.
    pub fn matches(&self, image: Option<&Value>) -> bool {
        match (self, image) {
            (Matcher::Any, _) => true,
            (_, None) => false,
            (Matcher::Discriminator(predicate), Some(image)) => predicate(image),
            (Matcher::Validator { schema, parse }, Some(image)) => match parse(image) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::trace!(schema, %reason, "image rejected by validator");
                    false
                }
            },
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Matcher::Any
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Any => f.write_str("Any"),
            Matcher::Discriminator(_) => f.write_str("Discriminator(..)"),
            Matcher::Validator { schema, .. } => {
                f.debug_struct("Validator").field("schema", schema).finish()
            }
        }
    }
}
