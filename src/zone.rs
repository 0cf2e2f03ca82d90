use hickory_proto::rr::{DNSClass, Name, RecordType};
use tracing::debug;

use crate::error::{ResolveError, Result};
use crate::resolver::{ResolveOptions, Resolver};

/// `name` with its leftmost label removed. The root is its own parent.
pub(crate) fn parent_name(name: &Name) -> Name {
    if name.is_root() {
        return Name::root();
    }
    let mut parent = name.base_name();
    parent.set_fqdn(name.is_fqdn());
    parent
}

impl Resolver {
    /// Finds the apex of the zone that holds `name`.
    ///
    /// Asks for the SOA of `name` and of each of its ancestors in turn; the
    /// first one that owns an SOA is the apex. NXDOMAIN, an empty answer,
    /// or an SOA reached through a CNAME all move one label up. Any other
    /// failure ends the walk. The root is returned when nothing below it
    /// claims authority.
    pub async fn zone_for_name(&self, name: &Name, rclass: DNSClass) -> Result<Name> {
        if !name.is_fqdn() {
            return Err(ResolveError::NotAbsolute(name.clone()));
        }

        let options = ResolveOptions::default();
        let mut current = name.clone();
        loop {
            match self.resolve_with(&current, RecordType::SOA, rclass, &options).await {
                Ok(answer) if answer.canonical_name() == &current => {
                    debug!(target = "resolver", event = "zone_found", name = %name, zone = %current);
                    return Ok(current);
                }
                Ok(answer) => {
                    debug!(target = "resolver", name = %current, alias = %answer.canonical_name(), "soa reached through alias");
                }
                Err(err) if err.is_definitive() => {
                    debug!(target = "resolver", name = %current, error = %err, "no soa here");
                }
                Err(err) => return Err(err),
            }

            if current.is_root() {
                return Ok(current);
            }
            current = parent_name(&current);
        }
    }
}
