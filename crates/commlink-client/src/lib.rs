pub mod chat;
pub mod commands;
pub mod config;
pub mod events;
pub mod payments;
pub mod router;
pub mod session;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use commands::{Command, CommandError};
pub use config::ClientConfig;
pub use events::ClientEvent;
pub use session::{spawn_session, SessionHandle};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("commlink_client=debug,commlink_net=debug,commlink_media=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
