use postern_common::traits::fsm::FiniteStateMachine;

use crate::command::Verb;

pub const HELO_ALREADY_SEEN: &str = "503 bad sequence, EHLO|HELO already recieved";
pub const RCPT_OUT_OF_SEQUENCE: &str = "503 5.5.1 bad sequence";
pub const DATA_OUT_OF_SEQUENCE: &str = "503 5.5.1 command out of sequence";

/// Where a session stands in the mail transaction.
///
/// Whether a greeting has been seen is tracked separately: without
/// `helo_mandatory` a client may start a transaction straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Greeted,
    Helo,
    Mail,
    Rcpt,
}

/// Input to the transition table besides the command, and where it reports
/// a rejection
#[derive(Debug, Default)]
pub struct Sequence {
    pub helo_seen: bool,
    pub rejection: Option<&'static str>,
}

impl State {
    /// The state an emptied transaction returns to
    #[must_use]
    pub const fn base(helo_seen: bool) -> Self {
        if helo_seen { Self::Helo } else { Self::Greeted }
    }

    /// The state `verb` leads to once its handler succeeds, or the `503` line
    /// rejecting it
    pub fn next(self, verb: Verb, helo_seen: bool) -> Result<Self, &'static str> {
        let mut sequence = Sequence {
            helo_seen,
            rejection: None,
        };

        let next = self.transition(verb, &mut sequence);
        sequence.rejection.map_or(Ok(next), Err)
    }
}

impl FiniteStateMachine for State {
    type Input = Verb;
    type Context = Sequence;

    fn transition(self, input: Self::Input, sequence: &mut Self::Context) -> Self {
        let helo_seen = sequence.helo_seen;
        let mut reject = |line| {
            sequence.rejection = Some(line);
            self
        };

        match (self, input) {
            (_, Verb::Helo | Verb::Ehlo) if helo_seen => reject(HELO_ALREADY_SEEN),
            (Self::Greeted, Verb::Helo | Verb::Ehlo) => Self::Helo,
            (_, Verb::MailFrom) => Self::Mail,
            (Self::Mail | Self::Rcpt, Verb::RcptTo) => Self::Rcpt,
            (_, Verb::RcptTo) => reject(RCPT_OUT_OF_SEQUENCE),
            (Self::Rcpt, Verb::Data) | (_, Verb::Rset) => Self::base(helo_seen),
            (_, Verb::Data) => reject(DATA_OUT_OF_SEQUENCE),
            (_, Verb::StartTls) => Self::Greeted,
            (state, _) => state,
        }
    }
}
