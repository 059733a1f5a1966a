//! Interactive selection of optional dependencies.

use anyhow::{Context, Result};
use dialoguer::MultiSelect;

/// Multi-selection over a list of labels. An empty selection is a valid,
/// non-erroneous outcome.
pub trait SelectionUi {
    fn select_multiple(&self, prompt: &str, labels: &[String]) -> Result<Vec<usize>>;
}

/// Terminal menu backed by dialoguer.
pub struct MenuSelection;

impl SelectionUi for MenuSelection {
    fn select_multiple(&self, prompt: &str, labels: &[String]) -> Result<Vec<usize>> {
        MultiSelect::new()
            .with_prompt(prompt)
            .items(labels)
            .interact()
            .context("Selection menu failed")
    }
}
