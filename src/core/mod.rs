pub mod app_state;
pub mod clock;
pub mod jobs;
pub mod settings;

pub use app_state::AppState;
pub use jobs::{JobRecord, JobRegistry, JobStatus};
pub use settings::{AppConfig, ServerConfig, APP_VERSION, SERVICE_NAME};
