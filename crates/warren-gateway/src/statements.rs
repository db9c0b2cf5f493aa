//! Registry vocabulary and the statements the gateway reads and writes.

use warren_core::{reference, OwnedId, Subject};
use warren_replica::Pattern;

/// Registry subject type for tenant accounts.
pub const ACCOUNT_TYPE: &str = "Account";

/// Registry subject type for the gateway's own principal.
pub const GATEWAY_TYPE: &str = "Gateway";

/// Account property listing administrator (primary accountable) IRIs.
pub const PRIMARY_ACCOUNTABLE: &str = "vf:primaryAccountable";

/// Account property listing owned sub-domain references.
pub const SUBDOMAIN_PROP: &str = "subdomain";

/// Account property listing registered key references.
pub const KEY_PROP: &str = "key";

/// Account property listing verified emails.
pub const EMAIL_PROP: &str = "email";

/// Account property listing allowed sub-domain naming schemes.
pub const NAMING_PROP: &str = "naming";

/// Account property listing allowed remote connection auth schemes.
pub const REMOTES_AUTH_PROP: &str = "remotesAuth";

/// The statement that an account owns a sub-domain.
pub fn account_has_subdomain(id: &OwnedId) -> Subject {
    Subject::new(&id.account).with(SUBDOMAIN_PROP, reference(id.to_relative_iri()))
}

/// The pattern asking whether an account owns a sub-domain.
pub fn has_subdomain(id: &OwnedId) -> Pattern {
    Pattern::id(&id.account).containing(SUBDOMAIN_PROP, reference(id.to_relative_iri()))
}

/// The pattern asking whether a user administers an account.
pub fn user_is_admin(user: &str, account: &str) -> Pattern {
    Pattern::id(account).containing(PRIMARY_ACCOUNTABLE, reference(user))
}
