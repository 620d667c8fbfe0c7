mod application;
mod presentation {
    pub mod cli;
}

use tracing_subscriber::EnvFilter;

fn main() -> bitarchive_monitor::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    application::run()
}
