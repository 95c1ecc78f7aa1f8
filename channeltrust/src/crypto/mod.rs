pub mod cipher;
pub mod kdf;
pub mod key_agreement;
pub mod keys;
