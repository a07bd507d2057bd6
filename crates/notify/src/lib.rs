//! Reviewer notification channels.
//!
//! Escalations fan out to channels sized to severity: high severity reaches
//! the primary channel, critical additionally pages. Channel failures are
//! isolated and non-fatal — the audit record is already persisted by the
//! time a notification leaves, so a lost page degrades visibility, never
//! safety.

pub mod dispatcher;
pub mod email;
pub mod pager;
pub mod templating;
pub mod traits;
pub mod webhook;

pub use dispatcher::{DispatchResult, Dispatcher};
pub use email::EmailNotifier;
pub use pager::PagerNotifier;
pub use templating::{EscalationContext, TemplateRenderer};
pub use traits::{Notification, Notifier, NotifyError};
pub use webhook::WebhookNotifier;
