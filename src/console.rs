//! Operator prompts for the interfaces to monitor.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use inquire::validator::Validation;
use inquire::{CustomType, Text};

use crate::launcher::WorkerSpec;
use crate::stats::interface_exists;

/// Check a requested worker count against the capacity.
pub fn check_count(count: usize, capacity: usize) -> Result<(), String> {
    if count == 0 || count > capacity {
        return Err(format!("enter a number between 1 and {capacity}"));
    }
    Ok(())
}

/// Check that `name` is an interface present under `root`.
pub fn check_interface(root: &Path, name: &str) -> Result<(), String> {
    if interface_exists(root, name.trim()) {
        Ok(())
    } else {
        Err(format!("no interface named {:?}", name.trim()))
    }
}

/// Turn command line names into worker specs, refusing unknown interfaces.
pub fn specs_from_args(root: &Path, names: &[String], capacity: usize) -> Result<Vec<WorkerSpec>> {
    if names.len() > capacity {
        bail!(
            "{} interfaces requested, at most {capacity} can be monitored",
            names.len()
        );
    }
    names
        .iter()
        .map(|name| {
            check_interface(root, name).map_err(anyhow::Error::msg)?;
            Ok(WorkerSpec::new(name.trim()))
        })
        .collect()
}

/// Ask how many interfaces to monitor, then for each name.
pub fn prompt_specs(root: &Path, capacity: usize) -> Result<Vec<WorkerSpec>> {
    let count = CustomType::<usize>::new("How many interfaces to monitor?")
        .with_help_message(&format!("1 to {capacity}"))
        .with_error_message("Please type a whole number")
        .with_validator(move |n: &usize| {
            Ok(match check_count(*n, capacity) {
                Ok(()) => Validation::Valid,
                Err(msg) => Validation::Invalid(msg.into()),
            })
        })
        .prompt()
        .context("Interface count prompt aborted")?;

    let mut specs = Vec::with_capacity(count);
    for i in 1..=count {
        let root: PathBuf = root.to_path_buf();
        let name = Text::new(&format!("Interface {i} of {count}:"))
            .with_validator(move |input: &str| {
                Ok(match check_interface(&root, input) {
                    Ok(()) => Validation::Valid,
                    Err(msg) => Validation::Invalid(msg.into()),
                })
            })
            .prompt()
            .context("Interface name prompt aborted")?;
        specs.push(WorkerSpec::new(name.trim()));
    }
    Ok(specs)
}
