pub mod appserver;
pub mod asyncutil;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod events;
pub mod group;
pub mod prechecks;
pub mod process;
pub mod proxy;
pub mod watch;
pub mod workers;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
