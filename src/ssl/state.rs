use crate::ssl::SslContext;

/// The bootstrap pipeline's state tag.
///
/// Transitions are driven entirely by [`crate::ssl::Driver`]; each variant
/// corresponds to one component in the specification (§4.2–§4.8). There is
/// no vtable here on purpose — the driver's `advance` is a single `match`,
/// which keeps the full transition graph visible in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SslState {
    NeedCaCerts,
    NeedCrls,
    NeedKey,
    NeedSubmitCsr,
    NeedCert,
    Wait,
    Done,
}

impl std::fmt::Display for SslState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SslState::NeedCaCerts => "NeedCaCerts",
            SslState::NeedCrls => "NeedCrls",
            SslState::NeedKey => "NeedKey",
            SslState::NeedSubmitCsr => "NeedSubmitCsr",
            SslState::NeedCert => "NeedCert",
            SslState::Wait => "Wait",
            SslState::Done => "Done",
        };
        f.write_str(name)
    }
}

/// The result of advancing one state.
///
/// `ExitRequested` only ever originates from [`SslState::Wait`] (Design
/// Note: the decision to stop polling is made there, but exiting the
/// process is the driver's call, not the state's).
#[derive(Debug)]
pub enum Transition {
    Next(SslState, SslContext),
    ExitRequested,
}
