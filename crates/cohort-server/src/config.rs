//! Server configuration: command-line flags with `COHORT_*` environment fallbacks.

use std::net::SocketAddr;
use std::path::PathBuf;

use cohort_pipeline::{Redirects, StudySettings, DEFAULT_TIMEOUT_SECONDS};

#[derive(Debug, Clone, clap::Args)]
pub struct ServerConfig {
    /// Pipeline definition file (YAML or JSON)
    #[arg(long, env = "COHORT_PIPELINE")]
    pub pipeline: PathBuf,

    /// SQLite database URL; the file is created when missing
    #[arg(long, env = "COHORT_DATABASE_URL", default_value = "sqlite://cohort.db")]
    pub database_url: String,

    /// Address to listen on
    #[arg(long, env = "COHORT_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Password for the admin summary; the route is disabled when unset
    #[arg(long, env = "COHORT_ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: Option<String>,

    /// Where completed participants are sent
    #[arg(long, env = "COHORT_COMPLETION_URL")]
    pub completion_url: Option<String>,

    /// Where failed participants are sent
    #[arg(long, env = "COHORT_FAILURE_URL")]
    pub failure_url: Option<String>,

    /// Where participants who decline consent are sent
    #[arg(long, env = "COHORT_DECLINE_URL")]
    pub decline_url: Option<String>,

    /// Ceiling on wall-clock seconds from session start to a submit
    #[arg(long, env = "COHORT_MAX_SESSION_SECONDS", default_value_t = DEFAULT_TIMEOUT_SECONDS)]
    pub max_session_seconds: i64,

    /// Ceiling on seconds since a session was last written
    #[arg(long, env = "COHORT_INACTIVITY_SECONDS", default_value_t = DEFAULT_TIMEOUT_SECONDS)]
    pub inactivity_seconds: i64,

    /// Reject `init` without a participant id instead of minting one
    #[arg(long, env = "COHORT_REQUIRE_PARTICIPANT_ID")]
    pub require_participant_id: bool,
}

impl ServerConfig {
    pub fn settings(&self) -> StudySettings {
        StudySettings {
            max_session_seconds: self.max_session_seconds,
            inactivity_seconds: self.inactivity_seconds,
            generate_missing_ids: !self.require_participant_id,
            redirects: Redirects {
                completion: non_empty(&self.completion_url),
                failure: non_empty(&self.failure_url),
                decline: non_empty(&self.decline_url),
            },
        }
    }

    /// The admin password, treating an empty value as unset.
    pub fn admin_password(&self) -> Option<String> {
        non_empty(&self.admin_password)
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ServerConfig,
    }

    #[test]
    fn defaults_apply() {
        let cli = Cli::try_parse_from(["cohort", "--pipeline", "study.yaml"]).unwrap();
        let config = cli.config;
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.database_url, "sqlite://cohort.db");

        let settings = config.settings();
        assert_eq!(settings.max_session_seconds, 1200);
        assert_eq!(settings.inactivity_seconds, 1200);
        assert!(settings.generate_missing_ids);
        assert!(settings.redirects.completion.is_none());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cli = Cli::try_parse_from([
            "cohort",
            "--pipeline",
            "study.yaml",
            "--admin-password",
            "  ",
            "--completion-url",
            "https://panel.example/done",
            "--require-participant-id",
        ])
        .unwrap();
        assert!(cli.config.admin_password().is_none());
        let settings = cli.config.settings();
        assert_eq!(settings.redirects.completion.as_deref(), Some("https://panel.example/done"));
        assert!(!settings.generate_missing_ids);
    }
}
