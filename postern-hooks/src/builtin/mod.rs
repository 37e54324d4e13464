use std::{
    fmt::{self, Display},
    sync::Arc,
};

use serde::Deserialize;

use crate::{Hook, HookError};

mod fail2ban;
mod greeting;

pub use fail2ban::Fail2Ban;
pub use greeting::Greeting;

/// Hooks that can be enabled from the configuration file
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Module {
    Greeting(Greeting),
    Fail2Ban(Fail2Ban),
}

impl Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Greeting(_) => f.write_str("Greeting Module"),
            Self::Fail2Ban(_) => f.write_str("Fail2Ban Module"),
        }
    }
}

impl Module {
    pub fn into_hook(self) -> Result<Arc<dyn Hook>, HookError> {
        Ok(match self {
            Self::Greeting(greeting) => {
                greeting.validate()?;
                Arc::new(greeting)
            }
            Self::Fail2Ban(fail2ban) => {
                fail2ban.validate()?;
                Arc::new(fail2ban)
            }
        })
    }
}
