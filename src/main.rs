use std::{
    fs::File,
    io::{BufWriter, Write},
    sync::mpsc,
    time::Duration,
};

use anyhow::Context;
use clap::{
    crate_description, crate_name, crate_version, value_parser, Arg, ArgAction, ArgMatches,
    Command,
};
use log::{error, info, warn};

use mandelgrid::{
    distributed::worker::Worker,
    render::{CompletedGeneration, EngineConfig, RenderEngine, Viewport},
    scheduler::SchedulerConfig,
};

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let matches = Command::new(crate_name!())
        .about(crate_description!())
        .version(crate_version!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .global(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            Command::new("render")
                .about("Renders one image on local (and optionally remote) workers")
                .arg(
                    Arg::new("width")
                        .long("width")
                        .default_value("1024")
                        .value_parser(value_parser!(u32))
                        .help("Image width in pixels"),
                )
                .arg(
                    Arg::new("height")
                        .long("height")
                        .default_value("768")
                        .value_parser(value_parser!(u32))
                        .help("Image height in pixels"),
                )
                .arg(
                    Arg::new("max_iterations")
                        .long("max-iter")
                        .default_value("1000")
                        .value_parser(value_parser!(u16))
                        .help("Iteration cap per pixel"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .help("Local compute threads [default: all cores]"),
                )
                .arg(
                    Arg::new("subtasks")
                        .long("subtasks")
                        .value_parser(value_parser!(u32))
                        .help("Row-range sub-tasks per image [default: derived from worker count]"),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_parser(value_parser!(u16))
                        .help("Accept remote workers on this TCP port"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("5000")
                        .value_parser(value_parser!(u64))
                        .help("Per-dispatch timeout in milliseconds"),
                )
                .arg(
                    Arg::new("retries")
                        .long("retries")
                        .default_value("3")
                        .value_parser(value_parser!(u32))
                        .help("Re-dispatch attempts before a sub-task is declared failed"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .default_value("mandelbrot.pgm")
                        .help("Output image (binary PGM)"),
                ),
        )
        .subcommand(
            Command::new("worker")
                .about("Serves a remote dispatcher until the connection is dropped")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .default_value("localhost")
                        .help("Dispatcher host"),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .required(true)
                        .value_parser(value_parser!(u16))
                        .help("Dispatcher port"),
                ),
        )
        .get_matches();

    simple_logger::init_with_level(match matches.get_count("v") {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    })
    .expect("This is not expected to fail");

    let result = match matches.subcommand() {
        Some(("render", render_matches)) => run_render(render_matches),
        Some(("worker", worker_matches)) => run_worker(worker_matches),
        _ => unreachable!(),
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run_render(matches: &ArgMatches) -> anyhow::Result<()> {
    let width = *matches.get_one::<u32>("width").expect("defaulted by clap");
    let height = *matches.get_one::<u32>("height").expect("defaulted by clap");
    let max_iterations = *matches
        .get_one::<u16>("max_iterations")
        .expect("defaulted by clap");
    let out_path = matches.get_one::<String>("out").expect("defaulted by clap");

    let config = EngineConfig {
        local_workers: matches
            .get_one::<usize>("workers")
            .copied()
            .unwrap_or_else(|| EngineConfig::default().local_workers),
        listen_port: matches.get_one::<u16>("port").copied(),
        subtasks_per_generation: matches.get_one::<u32>("subtasks").copied(),
        queue_capacity: None,
        scheduler: SchedulerConfig {
            dispatch_timeout: Duration::from_millis(
                *matches.get_one::<u64>("timeout").expect("defaulted by clap"),
            ),
            retry_ceiling: *matches.get_one::<u32>("retries").expect("defaulted by clap"),
        },
    };

    let engine = RenderEngine::new(config)?;
    if let Some(addr) = engine.worker_listen_addr() {
        info!("Accepting remote workers on {addr}");
    }

    let (sender, receiver) = mpsc::channel();
    engine.on_generation_complete(move |generation| {
        let _ = sender.send(generation);
    });

    engine.start_generation(Viewport::default(), width, height, max_iterations)?;
    let generation = receiver
        .recv()
        .context("Engine shut down before the image was finished")?;
    if generation.failed_tasks > 0 {
        warn!(
            "{} sub-tasks failed permanently; their rows stay blank",
            generation.failed_tasks
        );
    }

    write_pgm(out_path, &generation).with_context(|| format!("Could not write {out_path}"))?;
    info!(
        "Wrote {}x{} image to {out_path}",
        generation.width, generation.height
    );

    engine.shutdown();
    Ok(())
}

fn run_worker(matches: &ArgMatches) -> anyhow::Result<()> {
    let host = matches.get_one::<String>("host").expect("defaulted by clap");
    let port = *matches.get_one::<u16>("port").expect("required by clap");
    let mut worker = Worker::new(host, port)?;
    worker.run()?;
    Ok(())
}

/// Writes the iteration counts as an 8-bit binary PGM, scaled to the
/// brightest count in the image
fn write_pgm(path: &str, generation: &CompletedGeneration) -> std::io::Result<()> {
    let mut out_file = BufWriter::new(File::create(path)?);
    writeln!(out_file, "P5 {} {} 255", generation.width, generation.height)?;
    let brightest = generation
        .iterations
        .iter()
        .copied()
        .max()
        .unwrap_or(1)
        .max(1);
    for &count in &generation.iterations {
        let shade = (u32::from(count) * 255 / u32::from(brightest)) as u8;
        out_file.write_all(&[shade])?;
    }
    out_file.flush()
}
