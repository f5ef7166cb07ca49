pub mod secret_string;

pub use self::secret_string::SecretString;
