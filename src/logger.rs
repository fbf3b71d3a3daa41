use std::fmt;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Custom error type for logger initialization
#[derive(Debug)]
pub enum InitializeLoggerError {
    SetGlobalDefaultError(String),
}

impl fmt::Display for InitializeLoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitializeLoggerError::SetGlobalDefaultError(e) => write!(
                f,
                "Logger already initialized or failed to set global default subscriber: {}",
                e
            ),
        }
    }
}

impl std::error::Error for InitializeLoggerError {}

pub fn initialize_logger(
    logger_name: &str,
    verbose: Option<bool>,
) -> Result<(), InitializeLoggerError> {
    let rust_level = if verbose.unwrap_or(false) {
        Level::TRACE
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", rust_level)));

    // Get the filter's string representation for logging *before* it's consumed
    let filter_str = filter.to_string();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter) // filter is consumed here
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_level(true)
        .pretty()
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        let msg = format!("Logger already initialized or failed to set: {}", e);
        tracing::debug!("{}", msg);
        InitializeLoggerError::SetGlobalDefaultError(e.to_string())
    })?;

    tracing::info!(
        module_path = module_path!(),
        target = logger_name,
        "Logger initialized for '{}' with level {:?} (effective filter: {})",
        logger_name,
        rust_level,
        filter_str // Use the stored string representation
    );

    Ok(())
}
