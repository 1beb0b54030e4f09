use std::env;
use tracing::warn;

/// How a refused reschedule proposal resolves the appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalPolicy {
    /// Keep the appointment as it was before the proposal.
    Revert,
    /// Cancel the appointment, attributing the cancellation to the provider.
    Cancel,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub max_schedule_range_days: i64,
    pub slot_lock_ttl_minutes: i64,
    pub refusal_policy: RefusalPolicy,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            max_schedule_range_days: env::var("MAX_SCHEDULE_RANGE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            slot_lock_ttl_minutes: env::var("SLOT_LOCK_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            refusal_policy: match env::var("PROPOSAL_REFUSAL_POLICY").as_deref() {
                Ok("cancel") => RefusalPolicy::Cancel,
                Ok("revert") | Err(_) => RefusalPolicy::Revert,
                Ok(other) => {
                    warn!("Unknown PROPOSAL_REFUSAL_POLICY '{}', defaulting to revert", other);
                    RefusalPolicy::Revert
                }
            },
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }
}
