mod logs;
mod output;
mod run;
mod services;
pub mod ui;
mod versions;

pub use logs::logs_service;
pub use output::OutputFormat;
pub use run::{parse_input, run_command};
pub use services::{
    list_services, override_service, reset_parameter, restart_service, set_mode, set_parameter,
    show_service, start_service, status_service, stop_all_services, stop_service, OverrideTarget,
};
pub use versions::{install_service, list_versions, use_version};
