pub mod group;
pub mod synchronisation_source;
pub mod user;

pub use self::group::{Group, GroupSpec};
pub use self::synchronisation_source::{
    AUTHENTIK_TYPE, AuthentikSource, Provider, ProviderError, SynchronisationSource,
    SynchronisationSourceSpec,
};
pub use self::user::{User, UserSpec};

pub const API_GROUP: &str = "perm8s.io";
