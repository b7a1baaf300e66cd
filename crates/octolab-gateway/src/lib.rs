pub mod client;
pub mod crypto;
pub mod error;
pub mod preflight;
pub mod provisioner;

pub use client::{GuacClient, GuacConnection, GuacSession};
pub use crypto::{decrypt_password, encrypt_password, generate_secure_password};
pub use error::GatewayError;
pub use preflight::{guacamole_preflight, preflight_error_message, PreflightClassification, PreflightResult};
pub use provisioner::{
    guac_connection_name, guac_username, octobox_hostname, provision_guacamole_for_lab,
    teardown_guacamole_for_lab, ProvisionOutcome, TeardownOutcome,
};
