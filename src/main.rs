mod archive;
mod config;
mod error;
mod filesystem;
mod mount;
mod session;

use std::path::PathBuf;

use clap::Parser;

use archive::PasswordProvider;
pub use config::CONFIG;

type Result<T> = std::result::Result<T, error::Error>;

/// Mount a ZIP, 7Z or RAR archive as a read-only volume.
#[derive(Parser)]
#[command(name = "zipdrive", version, arg_required_else_help = true)]
struct Args {
    /// archive to mount (.zip, .7z or .rar)
    archive: PathBuf,
    /// single letter or directory path; candidates are tried in order
    /// when omitted
    mount_point: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(match CONFIG.log {
            0 => log::LevelFilter::Trace,
            1 => log::LevelFilter::Debug,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Warn,
            _ => log::LevelFilter::Error,
        })
        .try_init()
        .ok();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log::error!("something panic, exiting...");
        default_panic(info);
        std::process::exit(1);
    }));

    let args = Args::parse();
    let provider: PasswordProvider = Box::new(ask_password);

    if let Err(err) = mount::run(&args.archive, args.mount_point.as_deref(), provider).await {
        if err.is_user_error() {
            log::info!("mount rejected: {}", err);
        } else {
            // the only class that would be eligible for bug reporting
            log::error!("mount broke: {}", err);
        }
        eprintln!("error: {}", err);
        eprintln!("  {}", err.remediation());
        pause_if_interactive();
        std::process::exit(1);
    }
}

fn ask_password() -> Option<String> {
    use std::io::{BufRead, Write};

    eprint!("password: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    Some(line.trim_end_matches(['\r', '\n']).to_string())
}

fn pause_if_interactive() {
    use std::io::{BufRead, IsTerminal};

    if !std::io::stdin().is_terminal() {
        return;
    }
    eprintln!("press enter to exit...");
    let mut sink = String::new();
    std::io::stdin().lock().read_line(&mut sink).ok();
}
