//! Validation pipeline: every validator over every file, merged into one report.

use crate::core::finding::{FileUnderReview, Severity, ValidationFinding, ValidationReport, Validator};
use crate::core::group::{ChangeGroup, FileOp};
use crate::core::time;
use chrono::Utc;
use rayon::prelude::*;
use std::sync::Arc;

pub struct ValidationPipeline {
    validators: Vec<Arc<dyn Validator>>,
    approval_threshold: Severity,
    rules_version: String,
}

impl ValidationPipeline {
    pub fn new(approval_threshold: Severity, rules_version: &str) -> Self {
        Self {
            validators: Vec::new(),
            approval_threshold,
            rules_version: rules_version.to_string(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn validator_names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Runs all validators concurrently. Validators share nothing mutable, so
    /// the merged report depends only on the group's content and creation date.
    pub fn run(&self, group: &ChangeGroup) -> ValidationReport {
        let as_of = time::date_of_epoch_z(&group.created_at)
            .unwrap_or_else(|| Utc::now().date_naive());

        let texts: Vec<(&str, String, FileOp)> = group
            .files
            .iter()
            .filter(|f| f.op != FileOp::Delete && !is_binary(&f.new_content))
            .map(|f| {
                (
                    f.path.as_str(),
                    String::from_utf8_lossy(&f.new_content).into_owned(),
                    f.op,
                )
            })
            .collect();

        let jobs: Vec<(FileUnderReview<'_>, &Arc<dyn Validator>)> = texts
            .iter()
            .flat_map(|(path, content, op)| {
                let file = FileUnderReview {
                    path: *path,
                    content: content.as_str(),
                    op: *op,
                    as_of,
                };
                self.validators.iter().map(move |v| (file, v))
            })
            .collect();

        let findings: Vec<ValidationFinding> = jobs
            .par_iter()
            .flat_map_iter(|(file, validator)| validator.validate(file))
            .collect();

        ValidationReport::from_findings(
            &group.id,
            findings,
            self.approval_threshold,
            &self.rules_version,
        )
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|b| *b == 0)
}
