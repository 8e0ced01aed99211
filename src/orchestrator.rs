//! The build pipeline: parse, verify, sandbox, run, cleanup.
//!
//! Phase order across the whole action list: `verify` for all, then on the
//! host `pre_machine` for all, the sandbox launch and join, `post_machine`
//! for all. Inside the sandbox (or directly in no-sandbox mode) `run` for
//! all, then `cleanup`. Within each phase actions execute in recipe order.
//! A `run` failure skips the remaining runs; `cleanup` still executes for
//! every action whose `run` started, best effort.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::actions::Action;
use crate::context::BuildContext;
use crate::recipe::load_recipe;
use crate::sandbox::{in_machine, Machine, NspawnMachine};

/// Options collected from the command line.
#[derive(Debug)]
pub struct BuildOptions {
    pub artifact_dir: PathBuf,
    /// Run the actions directly instead of launching a sandbox.
    pub no_sandbox: bool,
    /// Image file path forwarded by `setup-image` across the sandbox
    /// boundary.
    pub internal_image: Option<PathBuf>,
}

/// Execute the recipe at `recipe_path`. Returns the process exit code to
/// propagate: the sandbox's when launching one, zero otherwise.
pub fn run_build(recipe_path: &Path, options: BuildOptions) -> Result<i32> {
    let recipe_path = clean_path(recipe_path)?;
    let recipe_dir = recipe_path
        .parent()
        .context("Recipe path has no parent directory")?
        .to_path_buf();
    fs::create_dir_all(&options.artifact_dir).with_context(|| {
        format!(
            "Failed to create artifact directory {}",
            options.artifact_dir.display()
        )
    })?;
    let artifact_dir = clean_path(&options.artifact_dir)?;

    let recipe = load_recipe(&recipe_path)?;
    let actions: Vec<&dyn Action> = recipe.actions.iter().map(|s| s.as_action()).collect();

    let scratch = if in_machine() {
        PathBuf::from("/scratch")
    } else {
        artifact_dir.join("scratch")
    };

    let mut context = BuildContext::new(
        scratch.join("rootdir"),
        artifact_dir.clone(),
        recipe_dir.clone(),
        recipe.architecture.clone(),
    );
    context.image = options.internal_image.clone();

    verify_all(&actions, &context)?;

    if !in_machine() && !options.no_sandbox {
        let mut machine = NspawnMachine::new();
        machine.add_volume(&artifact_dir);
        machine.add_volume(&recipe_dir);

        let mut args = vec!["--artifactdir".to_string(), artifact_dir.display().to_string()];
        pre_machine_all(&actions, &mut context, &mut machine, &mut args)?;
        args.push(recipe_path.display().to_string());

        let code = machine.run_with_args(&args)?;

        post_machine_all(&actions, &mut context)?;
        return Ok(code);
    }

    fs::create_dir_all(&scratch)
        .with_context(|| format!("Failed to create scratch directory {}", scratch.display()))?;

    run_all(&actions, &mut context)?;
    Ok(0)
}

fn verify_all(actions: &[&dyn Action], context: &BuildContext) -> Result<()> {
    for action in actions {
        action
            .verify(context)
            .with_context(|| format!("Verify failed for action '{}'", action.name()))?;
    }
    Ok(())
}

fn pre_machine_all(
    actions: &[&dyn Action],
    context: &mut BuildContext,
    machine: &mut dyn Machine,
    args: &mut Vec<String>,
) -> Result<()> {
    for action in actions {
        action
            .pre_machine(context, machine, args)
            .with_context(|| format!("Pre-machine failed for action '{}'", action.name()))?;
    }
    Ok(())
}

fn post_machine_all(actions: &[&dyn Action], context: &mut BuildContext) -> Result<()> {
    for action in actions {
        action
            .post_machine(context)
            .with_context(|| format!("Post-machine failed for action '{}'", action.name()))?;
    }
    Ok(())
}

/// Run every action, stopping at the first failure, then clean up every
/// action whose run started.
fn run_all(actions: &[&dyn Action], context: &mut BuildContext) -> Result<()> {
    let mut failure = None;
    let mut started = 0;
    for action in actions {
        started += 1;
        println!("==== {} ====", action.name());
        if let Err(err) = action.run(context) {
            failure = Some(err.context(format!("Action '{}' failed", action.name())));
            break;
        }
    }

    cleanup_all(&actions[..started], context);

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn cleanup_all(actions: &[&dyn Action], context: &mut BuildContext) {
    for action in actions {
        if let Err(err) = action.cleanup(context) {
            eprintln!("Cleanup of action '{}' failed: {:#}", action.name(), err);
        }
    }
}

fn clean_path(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("Failed to resolve path {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct RecordingAction {
        id: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        fail_run: bool,
    }

    impl RecordingAction {
        fn new(id: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                id,
                log: Rc::clone(log),
                fail_run: false,
            }
        }

        fn record(&self, phase: &str) {
            self.log.borrow_mut().push(format!("{}:{}", phase, self.id));
        }
    }

    impl Action for RecordingAction {
        fn name(&self) -> &str {
            self.id
        }

        fn verify(&self, _context: &BuildContext) -> Result<()> {
            self.record("verify");
            Ok(())
        }

        fn run(&self, _context: &mut BuildContext) -> Result<()> {
            self.record("run");
            if self.fail_run {
                bail!("induced failure");
            }
            Ok(())
        }

        fn cleanup(&self, _context: &mut BuildContext) -> Result<()> {
            self.record("cleanup");
            Ok(())
        }
    }

    fn test_context(temp: &TempDir) -> BuildContext {
        BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        )
    }

    #[test]
    fn phases_run_across_all_actions_in_order() {
        let temp = TempDir::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = RecordingAction::new("a", &log);
        let b = RecordingAction::new("b", &log);
        let actions: Vec<&dyn Action> = vec![&a, &b];
        let mut context = test_context(&temp);

        verify_all(&actions, &context).unwrap();
        run_all(&actions, &mut context).unwrap();

        assert_eq!(
            *log.borrow(),
            vec!["verify:a", "verify:b", "run:a", "run:b", "cleanup:a", "cleanup:b"]
        );
    }

    #[test]
    fn run_failure_skips_later_runs_but_cleans_up_started_ones() {
        let temp = TempDir::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = RecordingAction::new("a", &log);
        let mut b = RecordingAction::new("b", &log);
        b.fail_run = true;
        let c = RecordingAction::new("c", &log);
        let actions: Vec<&dyn Action> = vec![&a, &b, &c];
        let mut context = test_context(&temp);

        let err = run_all(&actions, &mut context).unwrap_err();
        assert!(err.to_string().contains("'b'"));
        assert_eq!(
            *log.borrow(),
            vec!["run:a", "run:b", "cleanup:a", "cleanup:b"]
        );
    }

    fn write_base_tar(path: &Path) {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        let content = b"base\n";
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/origin", &content[..])
            .unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn end_to_end_unpack_overlay_run_without_sandbox() {
        let temp = TempDir::new().unwrap();
        write_base_tar(&temp.path().join("base.tar"));
        fs::create_dir_all(temp.path().join("files/etc")).unwrap();
        fs::write(temp.path().join("files/etc/extra"), "overlaid\n").unwrap();

        let recipe_path = temp.path().join("recipe.toml");
        fs::write(
            &recipe_path,
            r#"
            architecture = "amd64"

            [[actions]]
            action = "unpack"
            file = "base.tar"

            [[actions]]
            action = "overlay"
            source = "files"

            [[actions]]
            action = "run"
            script = "touch done"
            chroot = false
            "#,
        )
        .unwrap();

        let code = run_build(
            &recipe_path,
            BuildOptions {
                artifact_dir: temp.path().to_path_buf(),
                no_sandbox: true,
                internal_image: None,
            },
        )
        .unwrap();
        assert_eq!(code, 0);

        let rootdir = fs::canonicalize(temp.path())
            .unwrap()
            .join("scratch/rootdir");
        assert_eq!(
            fs::read_to_string(rootdir.join("etc/origin")).unwrap(),
            "base\n"
        );
        assert_eq!(
            fs::read_to_string(rootdir.join("etc/extra")).unwrap(),
            "overlaid\n"
        );
        assert!(rootdir.join("done").is_file());
    }

    #[test]
    fn bad_recipe_fails_before_any_run() {
        let temp = TempDir::new().unwrap();
        let recipe_path = temp.path().join("recipe.toml");
        fs::write(
            &recipe_path,
            r#"
            architecture = "amd64"

            [[actions]]
            action = "teleport"
            "#,
        )
        .unwrap();

        assert!(run_build(
            &recipe_path,
            BuildOptions {
                artifact_dir: temp.path().to_path_buf(),
                no_sandbox: true,
                internal_image: None,
            },
        )
        .is_err());
        assert!(!temp.path().join("scratch").exists());
    }
}
