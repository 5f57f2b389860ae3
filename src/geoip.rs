//! GeoIP ACL (design component C3).
//!
//! Grounded on `libinetd/geoips.cpp`/`geoips.h`: an ordered rule list over
//! `{country, continent, city, timezone}` matched against a MaxMind DB,
//! first match wins, default verdict otherwise. Uses the `maxminddb` crate
//! (the real ecosystem equivalent of `libmaxminddb`) instead of FFI.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::addr::DefaultVerdict;
use crate::error::InetdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoField {
    Country,
    Continent,
    City,
    Timezone,
}

#[derive(Debug, Clone)]
pub struct GeoRule {
    pub field: GeoField,
    pub value: String,
    pub allow: bool,
}

/// Shared, reference-counted handle to an opened MMDB file, keyed by path
/// so multiple services pointing at the same database share one reader.
struct Databases {
    readers: Mutex<HashMap<PathBuf, Arc<maxminddb::Reader<Vec<u8>>>>>,
}

static DATABASES: OnceLock<Databases> = OnceLock::new();

fn databases() -> &'static Databases {
    DATABASES.get_or_init(|| Databases { readers: Mutex::new(HashMap::new()) })
}

fn open_shared(path: &Path) -> Result<Arc<maxminddb::Reader<Vec<u8>>>, InetdError> {
    let dbs = databases();
    let mut guard = dbs.readers.lock().unwrap();
    if let Some(reader) = guard.get(path) {
        return Ok(reader.clone());
    }
    let reader = maxminddb::Reader::open_readfile(path).map_err(|e| InetdError::BadConfig {
        file: path.display().to_string(),
        line: 0,
        reason: format!("cannot open GeoIP database: {e}"),
    })?;
    let reader = Arc::new(reader);
    guard.insert(path.to_path_buf(), reader.clone());
    Ok(reader)
}

struct Lookup {
    country: Option<String>,
    continent: Option<String>,
    city: Option<String>,
    timezone: Option<String>,
}

fn lookup(reader: &maxminddb::Reader<Vec<u8>>, addr: IpAddr) -> Lookup {
    use maxminddb::geoip2::City;
    let mut out = Lookup { country: None, continent: None, city: None, timezone: None };
    if let Ok(city) = reader.lookup::<City>(addr) {
        if let Some(city) = city {
            out.country = city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(str::to_string);
            out.continent = city
                .continent
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string());
            out.city = city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string());
            out.timezone = city
                .location
                .as_ref()
                .and_then(|l| l.time_zone)
                .map(str::to_string);
        }
    }
    out
}

/// Ordered GeoIP rule list plus default verdict, evaluated against one
/// shared, path-keyed MMDB reader.
pub struct GeoAcl {
    reader: Option<Arc<maxminddb::Reader<Vec<u8>>>>,
    rules: Vec<GeoRule>,
    default: DefaultVerdict,
}

static WARNED_UNSUPPORTED: OnceLock<()> = OnceLock::new();

impl GeoAcl {
    pub fn new(db_path: Option<&Path>, rules: Vec<GeoRule>, default: DefaultVerdict) -> Self {
        let reader = db_path.and_then(|p| match open_shared(p) {
            Ok(r) => Some(r),
            Err(e) => {
                log::warn!("geoip: {e}");
                None
            }
        });
        GeoAcl { reader, rules, default }
    }

    pub fn disabled() -> Self {
        WARNED_UNSUPPORTED.get_or_init(|| {
            log::warn!("geoip: no database configured; GeoIP ACL is inert for this service");
        });
        GeoAcl { reader: None, rules: Vec::new(), default: DefaultVerdict::Unset }
    }

    /// First matching rule wins; falls back to the default verdict (allow
    /// when unset).
    pub fn allowed(&self, addr: IpAddr) -> bool {
        let Some(reader) = &self.reader else { return true };
        if self.rules.is_empty() {
            return true;
        }
        let looked_up = lookup(reader, addr);
        for rule in &self.rules {
            let field = match rule.field {
                GeoField::Country => &looked_up.country,
                GeoField::Continent => &looked_up.continent,
                GeoField::City => &looked_up.city,
                GeoField::Timezone => &looked_up.timezone,
            };
            if let Some(v) = field {
                if v.eq_ignore_ascii_case(&rule.value) {
                    return rule.allow;
                }
            }
        }
        match self.default {
            DefaultVerdict::AllowAll => true,
            DefaultVerdict::DenyAll => false,
            DefaultVerdict::Unset => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_is_inert() {
        let acl = GeoAcl::disabled();
        assert!(acl.allowed("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn no_database_allows_everything() {
        let acl = GeoAcl::new(None, vec![GeoRule { field: GeoField::Country, value: "US".into(), allow: false }], DefaultVerdict::Unset);
        assert!(acl.allowed("8.8.8.8".parse().unwrap()));
    }
}
