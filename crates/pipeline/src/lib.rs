//! `salesfeed-pipeline` — the report pipeline: scheduled publish on one side,
//! a retrying consumer on the other.
//!
//! Producer: [`Schedule`] drives [`publish_daily_report`], which aggregates
//! the target day and performs a confirmed publish.
//!
//! Consumer: [`Consumer`] validates, persists and acknowledges each delivery,
//! retrying transient store failures by republishing with an incremented
//! attempt counter and a [`RetryPolicy`] backoff. Success triggers a
//! fire-and-forget [`Notifier`] send.

pub mod classify;
pub mod consume;
pub mod notify;
pub mod publish;
pub mod retry;
pub mod schedule;

pub use classify::{FailureClass, ProcessError, classify};
pub use consume::{Consumer, DropReason, HandlerOutcome};
pub use notify::{Notifier, NotifyError, RecordingNotifier, TracingNotifier};
pub use publish::{MESSAGE_KIND, PublishError, Publisher, publish_daily_report};
pub use retry::{DEFAULT_BACKOFF, RetryPolicy, RetryPolicyError};
pub use schedule::{Schedule, ScheduleError, run_scheduler};
