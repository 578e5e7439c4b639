//! The virtual machine runtime binary.  Loads an executable bytecode
//! image, boots the kernel and runs it to completion.
//!
//! Run with `--help` for more info.

use std::path::PathBuf;

use clap::Parser;

use viua::bytecode::Image;
use viua::ffi::PathLinker;
use viua::kernel::{Config, Kernel};

#[derive(Debug, Parser)]
#[command(version, disable_version_flag = true, about, long_about = None)]
struct Args {
    /// path to an executable bytecode image
    image: String,
    /// arguments passed through to the program's main function
    #[arg(trailing_var_arg = true)]
    program_args: Vec<String>,
    /// print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
    /// print scheduling diagnostics
    #[arg(short = 'V', long)]
    verbose: bool,
    /// enable debug logging
    #[arg(long)]
    debug: bool,
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for variable in ["VIUAPATH", "VIUAAFTERPATH"] {
        if let Ok(joined) = std::env::var(variable) {
            paths.extend(
                joined
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
            );
        }
    }
    paths
}

fn main() {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.debug {
        logger.filter_level(log::LevelFilter::Debug);
    } else if args.verbose {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.init();

    let image = match Image::load_file(&args.image) {
        Ok(image) => image,
        Err(error) => {
            eprintln!("viua: {}: {}", args.image, error);
            std::process::exit(1);
        }
    };

    let kernel = Kernel::new(Config::from_env());
    kernel.load_image(image);

    let paths = search_paths();
    if !paths.is_empty() {
        kernel.set_linker(Box::new(PathLinker::new(paths)));
    }

    // modules linked and foreign libraries loaded at boot
    for variable in ["VIUAPRELINK", "VIUAPREIMPORT"] {
        if let Ok(joined) = std::env::var(variable) {
            for module in joined.split(':').filter(|m| !m.is_empty()) {
                if let Err(error) = kernel.import(module) {
                    eprintln!("viua: {}", error);
                    std::process::exit(1);
                }
            }
        }
    }

    let mut argv = vec![args.image.clone()];
    argv.extend(args.program_args.clone());
    if let Err(error) = kernel.launch_main(argv) {
        eprintln!("viua: {}", error);
        std::process::exit(1);
    }

    let status = kernel.run();
    std::process::exit(status.code);
}
