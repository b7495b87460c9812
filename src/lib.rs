pub mod config;
pub mod credentials;
pub mod db;
pub mod fetcher;
pub mod gmail;
pub mod output;
pub mod pager;

pub use credentials::manager::{
    AccessTokenProvider, CredentialManager, CredentialRegistry, ManagerOptions,
};
pub use credentials::store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use credentials::{AccessToken, AuthError, Credential, CredentialState};
pub use db::{Database, SqliteCredentialStore};
pub use fetcher::{BatchFetcher, FetchError, BATCH_SIZE};
pub use gmail::{GmailClient, GoogleOAuthClient, Message};
pub use pager::{ListQuery, ListingPage, Pager, PagingError};
