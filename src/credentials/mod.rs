pub mod model;
pub mod policy;
pub mod pool;

pub use model::{
    CredentialFilter, CredentialSecret, CredentialStatus, PlatformHealth, ScraperCredential,
};
pub use policy::{CooldownPolicy, ExponentialBackoff, FailureDisposition};
pub use pool::{CredentialOutcome, CredentialPool};
