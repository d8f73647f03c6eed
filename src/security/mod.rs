//! Account lockout, security event logging and the guarded auth flows.

mod events;
mod flows;
mod lockout;

pub use events::{
    JsonlSecurityLogStore, MemorySecurityLogStore, SecurityEvent, SecurityEventType,
    SecurityLogEntry, SecurityLogStore, SecurityLogger,
};
pub use flows::{LoginFailureReason, LoginGuard, LoginOutcome, RegistrationGuard};
pub use lockout::{
    AccountLockoutPolicy, FailedLoginState, FailureOutcome, InMemoryLoginStateStore,
    LockoutState, LoginStateStore,
};
