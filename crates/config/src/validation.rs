//! Configuration validation utilities

use crate::schema::{Config, SignerMode};
use std::collections::HashSet;

/// Largest batch the runtime accepts in one `batch_all`
pub const MAX_BATCH_SIZE: usize = 100;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate complete configuration
    pub fn validate(config: &Config) -> ValidationReport {
        let mut report = ValidationReport::new();

        Self::validate_chain(config, &mut report);
        Self::validate_execution(config, &mut report);
        Self::validate_simulation(config, &mut report);
        Self::validate_signer(config, &mut report);
        Self::validate_broadcast(config, &mut report);
        Self::validate_sessions(config, &mut report);
        Self::validate_server(config, &mut report);
        Self::validate_logging(config, &mut report);

        report
    }

    fn validate_chain(config: &Config, report: &mut ValidationReport) {
        let chain = &config.chain;
        if chain.network.is_empty() {
            report.add_error("chain.network", "Network name cannot be empty");
        }

        if chain.existential_deposit == 0 {
            report.add_warning(
                "chain.existential_deposit",
                "Existential deposit is zero, reaping checks are disabled",
            );
        }

        if chain.pruning_depth == 0 {
            report.add_error("chain.pruning_depth", "Pruning depth cannot be 0");
        }

        let mut seen = HashSet::new();
        for account in &chain.accounts {
            if account.address.as_str().is_empty() {
                report.add_error("chain.accounts", "Account address cannot be empty");
            }
            if !seen.insert(account.address.as_str()) {
                report.add_error(
                    "chain.accounts",
                    &format!("Duplicate genesis account: {}", account.address),
                );
            }
            if account.balance > 0 && account.balance < chain.existential_deposit {
                report.add_warning(
                    "chain.accounts",
                    &format!("Genesis balance of {} is below the existential deposit", account.address),
                );
            }
        }
    }

    fn validate_execution(config: &Config, report: &mut ValidationReport) {
        let execution = &config.execution;
        if execution.timeout_seconds == 0 {
            report.add_error("execution.timeout_seconds", "Execution timeout cannot be 0");
        } else if execution.timeout_seconds > 3600 {
            report.add_warning("execution.timeout_seconds", "Execution timeout is longer than an hour");
        }

        if !(2..=MAX_BATCH_SIZE).contains(&execution.max_batch_size) {
            report.add_error(
                "execution.max_batch_size",
                &format!("Max batch size must be between 2 and {}", MAX_BATCH_SIZE),
            );
        }

        if execution.approval_queue_capacity == 0 {
            report.add_error("execution.approval_queue_capacity", "Approval queue capacity cannot be 0");
        }

        if execution.auto_approve {
            report.add_warning(
                "execution.auto_approve",
                "Auto-approve signs every request without user confirmation",
            );
        }
    }

    fn validate_simulation(config: &Config, report: &mut ValidationReport) {
        if config.simulation.fork_point_ttl_seconds > 60 {
            report.add_warning(
                "simulation.fork_point_ttl_seconds",
                "Fork point TTL is long, simulations may run against stale state",
            );
        }
    }

    fn validate_signer(config: &Config, report: &mut ValidationReport) {
        let signer = &config.signer;
        if signer.mode == SignerMode::Http {
            match signer.url.as_deref() {
                None | Some("") => {
                    report.add_error("signer.url", "Signer URL is required in http mode");
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    report.add_error("signer.url", "Signer URL must start with http:// or https://");
                }
                _ => {}
            }
        }

        if signer.timeout_seconds == 0 {
            report.add_error("signer.timeout_seconds", "Signer timeout cannot be 0");
        }
    }

    fn validate_broadcast(config: &Config, report: &mut ValidationReport) {
        let broadcast = &config.broadcast;
        if broadcast.reconnect_delay_ms == 0 {
            report.add_error("broadcast.reconnect_delay_ms", "Reconnect delay cannot be 0");
        }
        if broadcast.max_reconnect_delay_ms < broadcast.reconnect_delay_ms {
            report.add_error(
                "broadcast.max_reconnect_delay_ms",
                "Max reconnect delay cannot be below the initial delay",
            );
        }
    }

    fn validate_sessions(config: &Config, report: &mut ValidationReport) {
        if config.sessions.cleanup_interval_seconds == 0 {
            report.add_error("sessions.cleanup_interval_seconds", "Cleanup interval cannot be 0");
        }
        if config.sessions.retention_seconds < config.sessions.cleanup_interval_seconds {
            report.add_warning(
                "sessions.retention_seconds",
                "Retention is shorter than the cleanup interval",
            );
        }
    }

    fn validate_server(config: &Config, report: &mut ValidationReport) {
        if config.server.port == 0 {
            report.add_error("server.port", "Server port cannot be 0");
        } else if config.server.port < 1024 {
            report.add_warning("server.port", "Server port is below 1024, may require elevated privileges");
        }

        if config.server.request_timeout_seconds == 0 {
            report.add_error("server.request_timeout_seconds", "Request timeout cannot be 0");
        }

        if config.server.host.is_empty() {
            report.add_error("server.host", "Server host cannot be empty");
        }
    }

    fn validate_logging(config: &Config, report: &mut ValidationReport) {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            report.add_error(
                "logging.level",
                &format!("Invalid log level: {}. Valid levels: {:?}", config.logging.level, valid_levels),
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            report.add_error(
                "logging.format",
                &format!("Invalid log format: {}. Valid formats: {:?}", config.logging.format, valid_formats),
            );
        }
    }
}

/// Validation report containing errors and warnings
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

/// A validation issue (error or warning)
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, field: &str, message: &str) {
        self.errors.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }

    pub fn summary(&self) -> String {
        format!("Validation: {} errors, {} warnings", self.errors.len(), self.warnings.len())
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}
