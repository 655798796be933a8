use crate::errors::EmailVerifyError;
use once_cell::sync::OnceCell;
use std::fs::File;

/// The name of env variable for the path to the email verification configuration json.
pub const EMAIL_VERIFY_CONFIG_ENV: &str = "EMAIL_VERIFY_CONFIG";
/// The name of env variable for the path to the registry configuration json.
pub const REGISTRY_CONFIG_ENV: &str = "REGISTRY_CONFIG";

pub static GLOBAL_CONFIG_PARAMS: OnceCell<EmailVerifyConfigParams> = OnceCell::new();
pub static GLOBAL_REGISTRY_CONFIG_PARAMS: OnceCell<RegistryConfigParams> = OnceCell::new();

/// The [`EmailVerifyConfigParams`] used to configure [`crate::EmailVerifyCircuit`].
///
/// Outside of tests the parameters are read once from [`EMAIL_VERIFY_CONFIG_ENV`] and cached.
#[cfg(not(test))]
pub fn default_config_params() -> EmailVerifyConfigParams {
    GLOBAL_CONFIG_PARAMS.get_or_init(EmailVerifyConfigParams::get_from_env).clone()
}

#[cfg(test)]
pub fn default_config_params() -> EmailVerifyConfigParams {
    EmailVerifyConfigParams::get_from_env()
}

/// The [`RegistryConfigParams`] used to configure [`crate::dkim_registry::RegistryCircuit`].
#[cfg(not(test))]
pub fn default_registry_config_params() -> RegistryConfigParams {
    GLOBAL_REGISTRY_CONFIG_PARAMS.get_or_init(RegistryConfigParams::get_from_env).clone()
}

#[cfg(test)]
pub fn default_registry_config_params() -> RegistryConfigParams {
    RegistryConfigParams::get_from_env()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, EmailVerifyError> {
    let file = File::open(path).map_err(|e| EmailVerifyError::InvalidConfig(format!("{}: {}", path, e)))?;
    serde_json::from_reader(file).map_err(|e| EmailVerifyError::InvalidConfig(format!("{}: {}", path, e)))
}

fn env_path(env: &str) -> String {
    std::env::var(env).unwrap_or_else(|_| panic!("You must set the configure file path to {}.", env))
}

/// Configuration parameters for [`halo2_dynamic_sha256::Sha256DynamicConfig`].
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Sha256ConfigParams {
    /// The bits of lookup table. It must be a divisor of 16, i.e., 1, 2, 4, 8, and 16.
    pub num_bits_lookup: usize,
    /// The number of advice columns used to assign values in the SHA-256 chip.
    pub num_advice_columns: usize,
}

/// Configuration parameters for [`crate::sign_verify::SignVerifyConfig`].
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignVerifyConfigParams {
    /// The bits of RSA public key, 1024 or 2048.
    pub public_key_bits: usize,
}

/// Configuration parameters of the email header.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeaderConfigParams {
    /// The maximum size of the SHA-256 padded header in bytes, a multiple of 64.
    pub max_variable_byte_size: usize,
}

/// Configuration parameters of the email body.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BodyConfigParams {
    /// The maximum size of the SHA-256 padded body remainder in bytes, a multiple of 64.
    pub max_variable_byte_size: usize,
    /// The body prefix compressed outside the circuit.
    /// It must be a multiple of 64.
    pub skip_prefix_bytes_size: Option<usize>,
}

fn default_true() -> bool {
    true
}

/// Configuration parameters for the email verification circuit.
///
/// Although the types of some parameters are defined as [`Option`], [`EmailVerifyConfigParams::validate`] fails if they are omitted.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EmailVerifyConfigParams {
    /// The degree of the number of rows, i.e., 2^(`degree`) rows are set.
    pub degree: u32,
    /// The number of advice columns in the flex gate.
    pub num_flex_advice: usize,
    /// The number of advice columns for lookup constraints in the range chip.
    pub num_range_lookup_advice: usize,
    /// The number of fix columns in the flex gate.
    pub num_flex_fixed: usize,
    /// The bits of lookup table in the range chip, which must be less than `degree`.
    pub range_lookup_bits: usize,
    pub sha256_config: Option<Sha256ConfigParams>,
    pub sign_verify_config: Option<SignVerifyConfigParams>,
    pub header_config: Option<HeaderConfigParams>,
    pub body_config: Option<BodyConfigParams>,
    /// Whether the declared body hash is checked against the body.
    #[serde(default = "default_true")]
    pub body_hash_check: bool,
}

impl EmailVerifyConfigParams {
    /// Get the [`EmailVerifyConfigParams`] from the path of [`EMAIL_VERIFY_CONFIG_ENV`].
    ///
    /// # Panics
    /// Panics if the variable is unset or the file is missing or invalid.
    pub fn get_from_env() -> Self {
        let path = env_path(EMAIL_VERIFY_CONFIG_ENV);
        match Self::from_path(&path) {
            Ok(params) => params,
            Err(e) => panic!("{}", e),
        }
    }

    /// Read and validate the parameters in the json file at `path`.
    pub fn from_path(path: &str) -> Result<Self, EmailVerifyError> {
        let params: Self = read_json(path)?;
        params.validate()?;
        log::debug!("email verify config {}: {:?}", path, params);
        Ok(params)
    }

    pub fn sha256_params(&self) -> Result<&Sha256ConfigParams, EmailVerifyError> {
        self.sha256_config.as_ref().ok_or_else(|| missing("sha256_config"))
    }

    pub fn sign_verify_params(&self) -> Result<&SignVerifyConfigParams, EmailVerifyError> {
        self.sign_verify_config.as_ref().ok_or_else(|| missing("sign_verify_config"))
    }

    pub fn header_params(&self) -> Result<&HeaderConfigParams, EmailVerifyError> {
        self.header_config.as_ref().ok_or_else(|| missing("header_config"))
    }

    pub fn body_params(&self) -> Result<&BodyConfigParams, EmailVerifyError> {
        self.body_config.as_ref().ok_or_else(|| missing("body_config"))
    }

    /// Check the structural rules of the parameters.
    pub fn validate(&self) -> Result<(), EmailVerifyError> {
        if self.range_lookup_bits >= self.degree as usize {
            return Err(EmailVerifyError::InvalidConfig(format!(
                "range_lookup_bits {} must be less than degree {}",
                self.range_lookup_bits, self.degree
            )));
        }
        let sha256 = self.sha256_params()?;
        if sha256.num_bits_lookup == 0 || 16 % sha256.num_bits_lookup != 0 {
            return Err(EmailVerifyError::InvalidConfig(format!("num_bits_lookup {} must divide 16", sha256.num_bits_lookup)));
        }
        let public_key_bits = self.sign_verify_params()?.public_key_bits;
        if public_key_bits != 1024 && public_key_bits != 2048 {
            return Err(EmailVerifyError::UnsupportedModulusBits(public_key_bits));
        }
        check_block_aligned("header max_variable_byte_size", self.header_params()?.max_variable_byte_size)?;
        if self.body_hash_check {
            let body = self.body_params()?;
            check_block_aligned("body max_variable_byte_size", body.max_variable_byte_size)?;
            if let Some(skip) = body.skip_prefix_bytes_size {
                check_block_aligned("body skip_prefix_bytes_size", skip)?;
            }
        }
        Ok(())
    }
}

fn missing(name: &str) -> EmailVerifyError {
    EmailVerifyError::InvalidConfig(format!("{} is required", name))
}

fn check_block_aligned(name: &'static str, size: usize) -> Result<(), EmailVerifyError> {
    if size == 0 || size % 64 != 0 {
        return Err(EmailVerifyError::NotBlockAligned { name, size });
    }
    Ok(())
}

/// Configuration parameters for the registry update circuit.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfigParams {
    pub degree: u32,
    pub num_flex_advice: usize,
    pub num_range_lookup_advice: usize,
    pub num_flex_fixed: usize,
    pub range_lookup_bits: usize,
}

impl RegistryConfigParams {
    /// # Panics
    /// Panics if [`REGISTRY_CONFIG_ENV`] is unset or the file is missing or invalid.
    pub fn get_from_env() -> Self {
        let path = env_path(REGISTRY_CONFIG_ENV);
        match Self::from_path(&path) {
            Ok(params) => params,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn from_path(path: &str) -> Result<Self, EmailVerifyError> {
        let params: Self = read_json(path)?;
        if params.range_lookup_bits >= params.degree as usize {
            return Err(EmailVerifyError::InvalidConfig(format!(
                "range_lookup_bits {} must be less than degree {}",
                params.range_lookup_bits, params.degree
            )));
        }
        Ok(params)
    }
}
