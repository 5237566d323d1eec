pub mod alerts;
pub mod notify;
pub mod registry;
pub mod series;

pub use alerts::{Alert, AlertCenter, Severity};
pub use notify::{NotificationChannel, Notifier};
pub use registry::Metrics;
pub use series::{Aggregate, MetricType, SeriesStore};
