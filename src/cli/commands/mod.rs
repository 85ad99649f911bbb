//! One module per subcommand, each exposing `execute`.

pub mod detokenize;
pub mod hmac;
pub mod init;
pub mod kek;
pub mod remove;
pub mod search;
pub mod status;
pub mod tokenize;
pub mod versions;
