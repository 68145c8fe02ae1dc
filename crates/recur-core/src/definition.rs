//! Job definition files: decode, validate, normalize.
//!
//! Decoding fills every omitted field from [`JobDefinition::default`] and
//! ignores unknown fields. Validation then collects *all* rule violations
//! and rejects the whole file if there is at least one, so no partial job is
//! ever persisted.

use std::path::Path;

use crate::cron::{parse_timezone, CronSchedule};
use crate::error::{CoreError, Result, ValidationError};
use crate::types::{JobDefinition, NetworkScope, MAX_JITTER_MS};

pub const MAX_ID_LEN: usize = 128;
pub const MAX_RUN_SECONDS: u64 = 86_400;
pub const MAX_RETRIES: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// `.json` files are JSON, everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DefinitionFormat::Json,
            _ => DefinitionFormat::Yaml,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DefinitionFormat::Yaml => "YAML",
            DefinitionFormat::Json => "JSON",
        }
    }
}

pub fn parse_definition(text: &str, format: DefinitionFormat) -> Result<JobDefinition> {
    let raw: JobDefinition = match format {
        DefinitionFormat::Yaml => serde_yaml::from_str(text).map_err(|e| CoreError::Parse {
            format: format.label(),
            message: e.to_string(),
        })?,
        DefinitionFormat::Json => serde_json::from_str(text).map_err(|e| CoreError::Parse {
            format: format.label(),
            message: e.to_string(),
        })?,
    };
    Ok(validate(raw)?)
}

pub fn load_definition(path: &Path) -> Result<JobDefinition> {
    let text = std::fs::read_to_string(path)?;
    parse_definition(&text, DefinitionFormat::from_path(path))
}

/// Check every field rule, then return the normalized definition.
pub fn validate(job: JobDefinition) -> std::result::Result<JobDefinition, ValidationError> {
    let job = normalize(job);
    let mut errors = ValidationError::default();

    if job.id.is_empty() {
        errors.push("id", "is required");
    } else if job.id.len() > MAX_ID_LEN {
        errors.push("id", format!("must be at most {MAX_ID_LEN} characters"));
    } else if !job
        .id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        errors.push("id", "may only contain letters, digits, '.', '_' and '-'");
    } else if job.id.starts_with('.') {
        // The id names the job's artifact directory.
        errors.push("id", "must not start with '.'");
    }

    if job.version == 0 {
        errors.push("version", "must be at least 1");
    }

    if job.schedule.is_empty() {
        errors.push("schedule", "is required");
    } else if let Err(e) = CronSchedule::parse(&job.schedule) {
        errors.push("schedule", e);
    }

    if let Err(e) = parse_timezone(&job.timezone) {
        errors.push("timezone", e);
    }

    if job.jitter_ms > MAX_JITTER_MS {
        errors.push("jitterMs", format!("must be between 0 and {MAX_JITTER_MS}"));
    }

    if let (Some(nb), Some(na)) = (job.not_before, job.not_after) {
        if nb >= na {
            errors.push("notAfter", "must be later than notBefore");
        }
    }

    if job.graph_id.is_empty() {
        errors.push("graphId", "is required");
    }

    let res = &job.resources;
    if res.max_run_seconds == 0 || res.max_run_seconds > MAX_RUN_SECONDS {
        errors.push(
            "resources.maxRunSeconds",
            format!("must be between 1 and {MAX_RUN_SECONDS}"),
        );
    }
    if res.max_steps == 0 {
        errors.push("resources.maxSteps", "must be at least 1");
    }
    if res.network == NetworkScope::Allowlist && res.domain_allowlist.is_empty() {
        errors.push(
            "resources.domainAllowlist",
            "must list at least one domain when network is 'allowlist'",
        );
    }
    for (host, rpm) in &res.rate_limits {
        if *rpm == 0 {
            errors.push(
                format!("resources.rateLimits.{host}"),
                "must allow at least 1 request per minute",
            );
        }
    }

    if job.retry.max_retries > MAX_RETRIES {
        errors.push("retry.maxRetries", format!("must be at most {MAX_RETRIES}"));
    }

    errors.into_result().map(|()| job)
}

fn normalize(mut job: JobDefinition) -> JobDefinition {
    job.id = job.id.trim().to_string();
    job.name = job.name.trim().to_string();
    if job.name.is_empty() {
        job.name = job.id.clone();
    }
    job.schedule = job.schedule.trim().to_string();
    job.timezone = job.timezone.trim().to_string();
    job.graph_id = job.graph_id.trim().to_string();
    job.resources.domain_allowlist = job
        .resources
        .domain_allowlist
        .iter()
        .map(|d| d.trim().trim_start_matches("*.").to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    job.resources.rate_limits = std::mem::take(&mut job.resources.rate_limits)
        .into_iter()
        .map(|(host, rpm)| (host.trim().to_ascii_lowercase(), rpm))
        .collect();
    job.retry.retryable_codes = job
        .retry
        .retryable_codes
        .iter()
        .map(|c| c.trim().to_ascii_uppercase())
        .collect();
    job
}
