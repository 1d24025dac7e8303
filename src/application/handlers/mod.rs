pub mod log_dispatcher;

pub use log_dispatcher::LogDispatcher;
