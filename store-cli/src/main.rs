use std::{env, panic};

use anyhow::Result;
use clap::Parser;
use log::info;

use storecli::command::{self, Command};
use storecli::config::ConfigLoad;
use storecli::trace;

/// CMD like:
///     storecli init ./data
///     storecli put ./data greeting hello
///     storecli get ./data greeting --at <version>
#[derive(Debug, Parser)]
#[command(version, author, about)]
pub struct Args {
    #[clap(short, long, help = "debug mode: print parsed args and config")]
    debug: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

pub fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();
    if args.debug {
        println!("{args:?}");
    }

    let log_dir = format!("{}/.storecli", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level)?;

    let cfg = ConfigLoad::load();
    if args.debug {
        println!("{cfg:?}");
    }
    info!("storecli starting with args: {args:?}");

    command::run(args.cmd)
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: "".into(),
    };

    let default_hook = panic::take_hook();
    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
