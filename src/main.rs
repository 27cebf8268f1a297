use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use phone_pilot::agent::{AgentConfig, AgentLoop};
use phone_pilot::config::{self, Lang};
use phone_pilot::device::{AdbDevice, DeviceController, list_devices};
use phone_pilot::planner::{LocalPlanner, Planner, RemotePlanner};
use phone_pilot::run::StepEvent;
use phone_pilot::session::Session;

/// Phone Pilot - vision-model-driven Android automation
#[derive(Parser, Debug)]
#[command(
    name = "phone-pilot",
    about = "Drive an Android device toward a natural-language task with a vision model",
    after_help = "ENVIRONMENT VARIABLES:\n\
        PHONE_PILOT_ENDPOINT        Chat-completions endpoint URL\n\
        PHONE_PILOT_MODEL           Model name\n\
        PHONE_PILOT_API_KEY         API key for the remote backend\n\
        PHONE_PILOT_LOCAL_PORT      Port of the locally served model\n\
        PHONE_PILOT_ADB_PATH        Path to the adb binary\n\
        PHONE_PILOT_SESSION_DIR     Base directory for run sessions\n\
        PHONE_PILOT_MAX_STEPS       Step budget per run\n\
        PHONE_PILOT_LANG            Prompt language (cn or en)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a task against a connected device
    Run {
        /// The natural-language task to perform
        task: String,

        /// Device id (default: the first connected device)
        #[arg(short, long)]
        device: Option<String>,

        /// Planner backend: remote or local
        #[arg(short, long, default_value = "remote")]
        backend: String,

        /// Chat-completions endpoint URL (remote backend)
        #[arg(long, env = "PHONE_PILOT_ENDPOINT", default_value = config::DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Model name
        #[arg(long, env = "PHONE_PILOT_MODEL", default_value = config::DEFAULT_MODEL)]
        model: String,

        /// API key for the remote backend
        #[arg(long, env = "PHONE_PILOT_API_KEY", default_value = "")]
        api_key: String,

        /// Port of the locally served model (local backend)
        #[arg(long, env = "PHONE_PILOT_LOCAL_PORT", default_value = "8000")]
        local_port: u16,

        /// Step budget for this run
        #[arg(long, env = "PHONE_PILOT_MAX_STEPS", default_value = "100")]
        max_steps: usize,

        /// Prompt language: cn or en
        #[arg(long, env = "PHONE_PILOT_LANG", default_value = "cn")]
        lang: String,

        /// Per-device-command timeout in seconds
        #[arg(long, env = "PHONE_PILOT_DEVICE_TIMEOUT", default_value = "10")]
        step_timeout: u64,

        /// Output directory for run artifacts (default: auto-generated in session dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep screenshots and the step record after completion
        #[arg(long, short = 'k')]
        keep: bool,

        /// Output the run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List connected devices
    Devices,

    /// Capture a single screenshot from a connected device
    Capture {
        /// Device id (default: the first connected device)
        #[arg(short, long)]
        device: Option<String>,

        /// Output directory (default: auto-generated in session dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Run {
            task,
            device,
            backend,
            endpoint,
            model,
            api_key,
            local_port,
            max_steps,
            lang,
            step_timeout,
            output,
            keep,
            json,
        }) => {
            let lang = Lang::from_str(&lang)
                .ok_or_else(|| format!("Invalid language '{}'. Use: cn or en", lang))?;

            let device_id = resolve_device(device)?;
            let controller = AdbDevice::new(Some(device_id.clone()))
                .command_timeout(Duration::from_secs(step_timeout));

            let planner: Box<dyn Planner> = match backend.as_str() {
                "remote" => Box::new(RemotePlanner::new(endpoint, api_key).model(model).lang(lang)),
                "local" => {
                    let planner = LocalPlanner::on_port(local_port).lang(lang);
                    match planner.check_ready(5) {
                        Ok(true) => {}
                        Ok(false) | Err(_) => {
                            eprintln!(
                                "Warning: local model server not responding on port {}",
                                local_port
                            );
                        }
                    }
                    Box::new(planner)
                }
                other => {
                    return Err(format!("Invalid backend '{}'. Use: remote or local", other).into());
                }
            };

            let session = if let Some(ref dir) = output {
                Session::in_dir(dir)
            } else {
                Session::with_name(&task).keep(keep)
            };
            let session_dir = session.dir.clone();

            // Step progress is printed from the event stream below, so
            // the loop's own stderr logging stays off
            let agent_config = AgentConfig {
                max_steps,
                ..AgentConfig::default()
            };

            let (tx, rx) = mpsc::channel();
            let mut agent = AgentLoop::new(Box::new(controller), planner)
                .with_config(agent_config)
                .with_session(session)
                .with_events(tx);

            if !json {
                println!("Running task on {}: {}", device_id, task);
            }

            let run_task = task.clone();
            let handle = thread::spawn(move || agent.run(&run_task));

            // The loop pushes steps in completion order; print them as
            // they arrive
            for event in rx {
                match event {
                    StepEvent::Completed(step) => {
                        if json {
                            continue;
                        }
                        match (&step.action, &step.error) {
                            (Some(action), _) => {
                                let outcome = step
                                    .exec
                                    .as_ref()
                                    .map(|e| {
                                        if e.success {
                                            "ok".to_string()
                                        } else {
                                            format!(
                                                "failed: {}",
                                                e.message.as_deref().unwrap_or("unknown")
                                            )
                                        }
                                    })
                                    .unwrap_or_else(|| "-".to_string());
                                println!("  step {}: {} -> {}", step.index + 1, action, outcome);
                            }
                            (None, Some(error)) => {
                                println!("  step {}: rejected ({})", step.index + 1, error);
                            }
                            (None, None) => {}
                        }
                    }
                    StepEvent::Finished(_) => {}
                }
            }

            let record = handle
                .join()
                .map_err(|_| "agent thread panicked".to_string())?;

            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!(
                    "Run finished after {} step(s): {}",
                    record.history.len(),
                    record.result
                );
                if keep || output.is_some() {
                    println!("Artifacts: {}", session_dir.display());
                }
            }

            if !record.result.is_success() {
                std::process::exit(1);
            }
        }

        Some(Commands::Devices) => {
            let devices = list_devices()?;
            if devices.is_empty() {
                println!("No devices connected");
            } else {
                for id in devices {
                    println!("{}", id);
                }
            }
        }

        Some(Commands::Capture { device, output }) => {
            let device_id = resolve_device(device)?;
            let mut controller = AdbDevice::new(Some(device_id.clone()));

            let session = if let Some(ref dir) = output {
                Session::in_dir(dir)
            } else {
                Session::with_name(&format!("capture_{}", device_id)).keep(true)
            };
            session.init("capture", &device_id)?;

            let shot = controller.capture_screen()?;
            let path = session.dir.join("capture.png");
            std::fs::write(&path, &shot.png_data)?;

            println!("Captured screenshot: {}", path.display());
            println!("  Size: {}x{}", shot.width, shot.height);
            if shot.is_sensitive {
                println!("  Note: the device refused the capture; this is a fallback frame");
            }
        }

        None => {
            println!("Phone Pilot - vision-model-driven Android automation");
            println!();
            println!("Usage: phone-pilot <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run      Run a task against a connected device");
            println!("  devices  List connected devices");
            println!("  capture  Capture a single screenshot");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

/// Pick the device to drive: the requested id if connected, otherwise
/// the first connected device
fn resolve_device(requested: Option<String>) -> Result<String, Box<dyn Error>> {
    let devices = list_devices()?;
    match requested {
        Some(id) => {
            if !devices.contains(&id) {
                return Err(format!("Device '{}' is not connected", id).into());
            }
            Ok(id)
        }
        None => devices
            .into_iter()
            .next()
            .ok_or_else(|| "No devices connected".into()),
    }
}
