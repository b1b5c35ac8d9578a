//! Debugger application entry point.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Executable file (debuggee)
    debugee: String,

    /// Breakpoint locations (0xADDR, module.dll:offset or file:line)
    #[clap(short, long = "break")]
    breakpoints: Vec<String>,

    /// Additional directories to search for source files
    #[clap(short, long = "source-dir")]
    source_dirs: Vec<String>,

    /// Path to a session configuration file (TOML)
    #[clap(long)]
    config: Option<String>,

    /// Print local variables at every stop
    #[clap(long)]
    vars: bool,

    /// Arguments are passed to debugee
    #[arg(raw(true))]
    args: Vec<String>,
}

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use std::path::PathBuf;
    use wcdbg::cfg::SessionConfig;
    use wcdbg::debugger::state::DebuggerState;
    use wcdbg::session::SessionManager;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::from_file(path.as_ref())
            .with_context(|| format!("load config {path}"))?,
        None => SessionConfig::default(),
    };

    let manager = SessionManager::new(config);
    let session = manager.create_session(
        PathBuf::from(&args.debugee),
        args.args.clone(),
        args.source_dirs.iter().map(PathBuf::from).collect(),
    )?;

    let entry = session.run(None)?;
    println!(
        "stopped at entry: address={}, {} module(s) loaded",
        entry.address.as_deref().unwrap_or("?"),
        entry.modules_loaded.unwrap_or(0)
    );

    for location in &args.breakpoints {
        match session.set_breakpoint(location) {
            Ok(bp) => println!("breakpoint {} [{}]: {location}", bp.id, bp.status),
            Err(e) => eprintln!("breakpoint {location} failed: {e:#}"),
        }
    }

    loop {
        let stop = session.resume(None)?;
        match stop.state {
            DebuggerState::Exited => {
                println!("debuggee exited with code {}", stop.exit_code.unwrap_or(0));
                break;
            }
            _ => {
                let reason = stop
                    .reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                print!(
                    "stopped: reason={reason}, address={}",
                    stop.address.as_deref().unwrap_or("?")
                );
                if let Some(source) = &stop.source {
                    print!(" ({}:{})", source.file, source.line);
                }
                println!();

                if args.vars {
                    match session.variables() {
                        Ok(variables) => {
                            for var in variables {
                                println!(
                                    "  {} {} = {} [{}]",
                                    var.type_name, var.name, var.value, var.location
                                );
                            }
                        }
                        Err(e) => eprintln!("  variables unavailable: {e:#}"),
                    }
                }
            }
        }
    }

    manager.close_all();
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    let _ = Args::parse();
    eprintln!("wcdbg drives the Win32 debug interface and only runs on Windows hosts");
    std::process::exit(1);
}
