mod info;
mod run;

pub use info::show_info;
pub use run::run_service;
