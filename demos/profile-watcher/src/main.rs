//! # Profile Watcher Example
//!
//! Routes a batch of user-profile stream records to handlers that care
//! about specific attribute changes, then prints the partial batch
//! response a stream source expects back.
//!
//! ```text
//! cargo run -p profile-watcher-example                  # built-in sample
//! cargo run -p profile-watcher-example -- event.json    # your own batch
//! RUST_LOG=ripple_core=debug,profile_watcher_example=info cargo run -p profile-watcher-example
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use ripple_core::{
    handler_fn, ChangeKind, FilterSpec, HandlerOptions, Matcher, RecordChange, RecordHandler,
    RouterBuilder, RouterConfig, StreamEvent, TracingMiddleware,
};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Record Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct UserProfile {
    pk: String,
    name: String,
    #[serde(default)]
    email: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

struct WelcomeEmail;

#[async_trait]
impl RecordHandler for WelcomeEmail {
    async fn handle(&self, change: &RecordChange) -> Result<()> {
        let Some(profile) = change.new_as::<UserProfile>()? else {
            return Ok(());
        };
        match profile.email {
            Some(email) => info!(name = %profile.name, %email, "sending welcome mail"),
            None => bail!("user {} signed up without an email", profile.pk),
        }
        Ok(())
    }
}

struct ThemeSwitch;

#[async_trait]
impl RecordHandler for ThemeSwitch {
    async fn handle(&self, change: &RecordChange) -> Result<()> {
        let theme = change
            .new
            .as_ref()
            .and_then(|image| image.get_path("preferences.theme"))
            .and_then(|theme| theme.as_str())
            .unwrap_or("-");
        info!(seq = change.sequence_number(), theme, "theme switched");
        Ok(())
    }
}

// ============================================================================
// Sample Batch
// ============================================================================

const SAMPLE: &str = r#"{
  "Records": [
    {
      "eventID": "1",
      "eventName": "INSERT",
      "awsRegion": "eu-west-1",
      "dynamodb": {
        "Keys": {"pk": {"S": "user#1"}},
        "NewImage": {
          "pk": {"S": "user#1"},
          "name": {"S": "Ada"},
          "email": {"S": "ada@example.com"},
          "preferences": {"M": {"theme": {"S": "light"}}}
        },
        "SequenceNumber": "100"
      }
    },
    {
      "eventID": "2",
      "eventName": "MODIFY",
      "awsRegion": "eu-west-1",
      "dynamodb": {
        "Keys": {"pk": {"S": "user#1"}},
        "OldImage": {
          "pk": {"S": "user#1"},
          "name": {"S": "Ada"},
          "email": {"S": "ada@example.com"},
          "preferences": {"M": {"theme": {"S": "light"}}}
        },
        "NewImage": {
          "pk": {"S": "user#1"},
          "name": {"S": "Ada"},
          "email": {"NULL": true},
          "preferences": {"M": {"theme": {"S": "dark"}}}
        },
        "SequenceNumber": "101"
      }
    },
    {
      "eventID": "3",
      "eventName": "INSERT",
      "awsRegion": "eu-west-1",
      "dynamodb": {
        "Keys": {"pk": {"S": "user#2"}},
        "NewImage": {"pk": {"S": "user#2"}, "name": {"S": "Grace"}},
        "SequenceNumber": "102"
      }
    }
  ]
}"#;

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ripple_core=info,profile_watcher_example=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let raw = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => SAMPLE.to_string(),
    };
    let event: StreamEvent = serde_json::from_str(&raw)?;

    let router = RouterBuilder::new(RouterConfig::from_env()?)
        .with_middleware(TracingMiddleware)
        .on_insert_with(
            Matcher::schema::<UserProfile>(),
            WelcomeEmail,
            HandlerOptions::new().id("welcome-email"),
        )
        .on_modify_with(
            Matcher::schema::<UserProfile>(),
            ThemeSwitch,
            HandlerOptions::new()
                .id("theme-switch")
                .filter(FilterSpec::attribute("preferences.theme").new_value("dark")),
        )
        .on_modify_with(
            Matcher::any(),
            handler_fn(|change: RecordChange| async move {
                info!(seq = change.sequence_number(), "email address cleared");
                anyhow::Ok(())
            }),
            HandlerOptions::new().id("email-cleared").filter(
                FilterSpec::attribute("email").change_kinds(ChangeKind::FieldCleared),
            ),
        )
        .build()?;

    let outcome = router.process(&event).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.batch_item_failures())?
    );

    Ok(())
}
