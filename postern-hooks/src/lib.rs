//! Hook points run by the SMTP session.
//!
//! Hooks are compiled in and registered at start-up into an ordered list per
//! [`HookPoint`]. Each returns an [`Outcome`]: `done` asks the session to skip
//! its default handling for the phase, `drop` ends the session and stops the
//! remaining hooks from running.

use std::{
    fmt::{self, Debug, Display},
    sync::Arc,
};

use ahash::AHashMap;
use async_trait::async_trait;
use postern_common::{context::Context, internal};
use postern_tracing::traced;
use serde::Deserialize;
use thiserror::Error;

pub mod builtin;

pub use builtin::Module;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPoint {
    Connect,
    Helo,
    MailPre,
    MailPost,
    RcptTo,
    Data,
    BeforeQueue,
    Quit,
    ExitAsap,
    /// Runs after every command. Only `drop` is honoured.
    Notify,
    /// Observes the result of an `AUTH` exchange
    Auth,
}

impl Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::MailPre => "mailpre",
            Self::MailPost => "mailpost",
            Self::RcptTo => "rcptto",
            Self::Data => "data",
            Self::BeforeQueue => "beforequeue",
            Self::Quit => "quit",
            Self::ExitAsap => "exitasap",
            Self::Notify => "notify",
            Self::Auth => "auth",
        })
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Outcome {
    pub done: bool,
    pub drop: bool,
}

impl Outcome {
    #[must_use]
    pub const fn proceed() -> Self {
        Self {
            done: false,
            drop: false,
        }
    }

    #[must_use]
    pub const fn done() -> Self {
        Self {
            done: true,
            drop: false,
        }
    }

    #[must_use]
    pub const fn drop() -> Self {
        Self {
            done: false,
            drop: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("{hook} failed: {reason}")]
    Failed { hook: String, reason: String },

    #[error("Invalid configuration for {hook}: {reason}")]
    Configuration { hook: String, reason: String },
}

#[async_trait]
pub trait Hook: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// The points this hook is registered for
    fn points(&self) -> &[HookPoint];

    async fn call(&self, point: HookPoint, ctx: &mut Context) -> Result<Outcome, HookError>;

    /// Called once an `AUTH` exchange finishes, whether it succeeded or not
    async fn auth(
        &self,
        _user: &str,
        _password: &str,
        _success: bool,
        _ctx: &mut Context,
    ) -> Result<Outcome, HookError> {
        Ok(Outcome::proceed())
    }
}

/// Ordered hooks for every point, shared by all sessions of a listener
#[derive(Clone, Default)]
pub struct Registry {
    hooks: Arc<AHashMap<HookPoint, Vec<Arc<dyn Hook>>>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (point, hooks) in self.hooks.iter() {
            map.entry(point, &hooks.iter().map(|h| h.name()).collect::<Vec<_>>());
        }
        map.finish()
    }
}

impl Registry {
    /// Registers every hook at each point it declares, keeping the given order
    #[must_use]
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        let mut map: AHashMap<HookPoint, Vec<Arc<dyn Hook>>> = AHashMap::default();

        for hook in hooks {
            internal!(level = INFO, "Registering hook {} for {:?}", hook.name(), hook.points());
            for point in hook.points() {
                map.entry(*point).or_default().push(Arc::clone(&hook));
            }
        }

        Self {
            hooks: Arc::new(map),
        }
    }

    /// Builds the registry from configured modules
    pub fn from_modules(modules: Vec<Module>) -> Result<Self, HookError> {
        let hooks = modules
            .into_iter()
            .map(Module::into_hook)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(hooks))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn registered(&self, point: HookPoint) -> &[Arc<dyn Hook>] {
        self.hooks.get(&point).map_or(&[], Vec::as_slice)
    }

    /// Runs the hooks for `point` in order.
    ///
    /// A failing hook is logged and counts as having made no decision.
    #[traced(instrument(level = tracing::Level::TRACE, skip(self, ctx), fields(session = %ctx.id)), timing(precision = "us"))]
    pub async fn dispatch(&self, point: HookPoint, ctx: &mut Context) -> Outcome {
        let mut outcome = Outcome::proceed();

        for hook in self.registered(point) {
            match hook.call(point, ctx).await {
                Ok(result) => {
                    outcome.done |= result.done;
                    if result.drop {
                        internal!(level = DEBUG, "Hook {} dropped session at {point}", hook.name());
                        outcome.drop = true;
                        break;
                    }
                }
                Err(err) => {
                    internal!(level = ERROR, "Hook {} failed at {point}: {err}", hook.name());
                }
            }
        }

        if point == HookPoint::Notify {
            outcome.done = false;
        }

        outcome
    }

    /// Runs the `auth` callback of every hook registered for [`HookPoint::Auth`]
    pub async fn dispatch_auth(
        &self,
        user: &str,
        password: &str,
        success: bool,
        ctx: &mut Context,
    ) -> Outcome {
        let mut outcome = Outcome::proceed();

        for hook in self.registered(HookPoint::Auth) {
            match hook.auth(user, password, success, ctx).await {
                Ok(result) => {
                    outcome.done |= result.done;
                    if result.drop {
                        outcome.drop = true;
                        break;
                    }
                }
                Err(err) => {
                    internal!(level = ERROR, "Hook {} failed at auth: {err}", hook.name());
                }
            }
        }

        outcome
    }
}
