pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod notify;
pub mod observer;
pub mod poller;
pub mod store;
pub mod view;

pub use backend::{
    is_native_device, select_backend, ExecutionBackend, ExecutionError, ModemBackend,
    SimulatedBackend,
};
pub use config::{load_config, load_config_from_str, resolve_config, Config};
pub use error::{ConfigError, QueueError, Result, UssdqError, ValidationError};
pub use executor::{ExecutionReport, Executor};
pub use model::{NewOperation, Operation, OperationStatus, Transition};
pub use notify::{Notification, NotificationKind, Notifier};
pub use observer::{ObserverHandle, QueueObserver};
pub use poller::{PollerHandle, QueuePoller, TickOutcome};
pub use store::{ChangeKind, OperationStore, SqliteStore, StoreChange, StoreError, Subscription};
pub use view::render_table;
