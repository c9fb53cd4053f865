pub mod keys;
pub mod x509;

pub use keys::PrivateKey;
pub use x509::{is_revoked, Certificate, Crl};
