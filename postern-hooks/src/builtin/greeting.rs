use async_trait::async_trait;
use postern_common::context::Context;
use serde::Deserialize;

use crate::{Hook, HookError, HookPoint, Outcome};

/// Replaces the connect banner with a fixed one
#[derive(Debug, Deserialize)]
pub struct Greeting {
    banner: String,
}

impl Greeting {
    #[must_use]
    pub fn new(banner: impl Into<String>) -> Self {
        Self {
            banner: banner.into(),
        }
    }

    pub(super) fn validate(&self) -> Result<(), HookError> {
        if self.banner.contains(['\r', '\n']) {
            return Err(HookError::Configuration {
                hook: String::from("greeting"),
                reason: String::from("the banner must be a single line"),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Hook for Greeting {
    fn name(&self) -> &str {
        "greeting"
    }

    fn points(&self) -> &[HookPoint] {
        &[HookPoint::Connect]
    }

    async fn call(&self, _point: HookPoint, ctx: &mut Context) -> Result<Outcome, HookError> {
        ctx.reply(format!("220 {}", self.banner));
        Ok(Outcome::done())
    }
}
