use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use postern_common::{context::Context, internal};
use serde::Deserialize;

use crate::{Hook, HookError, HookPoint, Outcome};

#[derive(Debug, Clone, Copy)]
struct Offender {
    failures: u32,
    banned_until: Option<Instant>,
}

/// Bans a peer after repeated failed `AUTH` attempts. Banned peers are
/// dropped as soon as they connect.
#[derive(Debug, Deserialize)]
pub struct Fail2Ban {
    #[serde(default = "default_max_failures")]
    max_failures: u32,
    #[serde(default = "default_ban_secs")]
    ban_secs: u64,
    #[serde(skip)]
    offenders: Arc<DashMap<IpAddr, Offender>>,
}

const fn default_max_failures() -> u32 {
    5
}

const fn default_ban_secs() -> u64 {
    3600
}

impl Default for Fail2Ban {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            ban_secs: default_ban_secs(),
            offenders: Arc::default(),
        }
    }
}

impl Fail2Ban {
    #[must_use]
    pub const fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    #[must_use]
    pub const fn with_ban_secs(mut self, ban_secs: u64) -> Self {
        self.ban_secs = ban_secs;
        self
    }

    pub(super) fn validate(&self) -> Result<(), HookError> {
        if self.max_failures == 0 {
            return Err(HookError::Configuration {
                hook: String::from("fail2ban"),
                reason: String::from("max_failures must be at least 1"),
            });
        }

        Ok(())
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let expired = match self.offenders.get(&ip).and_then(|o| o.banned_until) {
            Some(until) if until > now => return true,
            Some(_) => true,
            None => false,
        };

        if expired {
            self.offenders.remove(&ip);
        }

        false
    }

    fn record_failure(&self, ip: IpAddr) {
        let mut offender = self.offenders.entry(ip).or_insert(Offender {
            failures: 0,
            banned_until: None,
        });

        offender.failures += 1;
        if offender.failures >= self.max_failures {
            internal!(level = WARN, "Banning {ip} after {} failed AUTH attempts", offender.failures);
            offender.banned_until = Some(Instant::now() + Duration::from_secs(self.ban_secs));
        }
    }
}

#[async_trait]
impl Hook for Fail2Ban {
    fn name(&self) -> &str {
        "fail2ban"
    }

    fn points(&self) -> &[HookPoint] {
        &[HookPoint::Connect, HookPoint::Auth]
    }

    async fn call(&self, point: HookPoint, ctx: &mut Context) -> Result<Outcome, HookError> {
        if point == HookPoint::Connect && self.is_banned(ctx.peer.ip()) {
            internal!(level = INFO, "Dropping banned peer {}", ctx.peer);
            return Ok(Outcome::drop());
        }

        Ok(Outcome::proceed())
    }

    async fn auth(
        &self,
        _user: &str,
        _password: &str,
        success: bool,
        ctx: &mut Context,
    ) -> Result<Outcome, HookError> {
        if success {
            self.offenders.remove(&ctx.peer.ip());
        } else {
            self.record_failure(ctx.peer.ip());
        }

        Ok(Outcome::proceed())
    }
}
