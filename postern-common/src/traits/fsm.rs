pub trait FiniteStateMachine {
    type Input;
    type Context;

    /// Moves to the state that follows `input`. Inputs that are not valid
    /// for the current state produce the machine's rejection state instead.
    #[must_use]
    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self;
}
