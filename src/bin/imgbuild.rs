use anyhow::{bail, Result};
use std::path::PathBuf;
use std::process::exit;

use imgbuild::orchestrator::{run_build, BuildOptions};

fn usage() {
    eprintln!("Usage: imgbuild [OPTIONS] <recipe>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --artifactdir <path>  Directory for inputs and outputs (default: .)");
    eprintln!("  --no-sandbox          Run actions directly instead of in a sandbox");
    eprintln!("  -h, --help            Show this help");
}

fn parse_args() -> Result<(PathBuf, BuildOptions)> {
    let mut artifact_dir: Option<PathBuf> = None;
    let mut no_sandbox = false;
    let mut internal_image: Option<PathBuf> = None;
    let mut recipe: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--artifactdir" => {
                let value = args.next();
                let Some(value) = value else {
                    bail!("--artifactdir requires a value");
                };
                artifact_dir = Some(PathBuf::from(value));
            }
            "--no-sandbox" => no_sandbox = true,
            // Internal: set by setup-image when re-invoking inside the
            // sandbox.
            "--internal-image" => {
                let value = args.next();
                let Some(value) = value else {
                    bail!("--internal-image requires a value");
                };
                internal_image = Some(PathBuf::from(value));
            }
            "-h" | "--help" => {
                usage();
                exit(0);
            }
            other if other.starts_with('-') => {
                bail!("Unknown option '{}'", other);
            }
            other => {
                if recipe.is_some() {
                    bail!("Only one recipe may be given");
                }
                recipe = Some(PathBuf::from(other));
            }
        }
    }

    let Some(recipe) = recipe else {
        usage();
        bail!("No recipe given");
    };
    let artifact_dir = match artifact_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    Ok((
        recipe,
        BuildOptions {
            artifact_dir,
            no_sandbox,
            internal_image,
        },
    ))
}

fn main() {
    let result = parse_args().and_then(|(recipe, options)| run_build(&recipe, options));
    match result {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit(1);
        }
    }
}
