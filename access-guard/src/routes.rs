//! Route tables
//!
//! Both tables map a path pattern to the roles allowed there and are
//! matched in declaration order, first match wins. Offline navigation uses
//! plain path prefixes; online navigation uses regexes.

use auth_offline::Role;
use regex::Regex;

pub const SIGN_IN_PATH: &str = "/sign-in";
pub const OFFLINE_LOGIN_PATH: &str = "/offline-login";
pub const OFFLINE_SYNC_API: &str = "/api/offline-sync";

/// Reachable without any identity
pub const PUBLIC_PREFIXES: [&str; 3] = [SIGN_IN_PATH, OFFLINE_LOGIN_PATH, OFFLINE_SYNC_API];

/// Where a role lands after sign-in or a refused navigation
pub fn landing_path(role: Role) -> &'static str {
    match role {
        Role::Admin => "/admin",
        Role::Receptionist => "/receptionist",
        Role::Accountant => "/accounts",
        Role::LabTechnician => "/lab",
        Role::InventoryManager => "/inventory",
    }
}

pub struct PrefixRule {
    pub prefix: &'static str,
    pub roles: &'static [Role],
}

/// Offline role table. Admin bypasses it.
pub const OFFLINE_PREFIXES: &[PrefixRule] = &[
    PrefixRule {
        prefix: "/admin",
        roles: &[Role::Admin],
    },
    PrefixRule {
        prefix: "/receptionist",
        roles: &[Role::Receptionist],
    },
    PrefixRule {
        prefix: "/accounts",
        roles: &[Role::Accountant],
    },
    // Reception hands finished reports to patients
    PrefixRule {
        prefix: "/lab/reports",
        roles: &[Role::LabTechnician, Role::Receptionist],
    },
    PrefixRule {
        prefix: "/lab",
        roles: &[Role::LabTechnician],
    },
    PrefixRule {
        prefix: "/inventory",
        roles: &[Role::InventoryManager],
    },
];

/// Online route table entries: pattern, permitted roles
const ONLINE_ROUTES: &[(&str, &[Role])] = &[
    (r"^/admin(?:/|$)", &[Role::Admin]),
    (r"^/receptionist(?:/|$)", &[Role::Admin, Role::Receptionist]),
    (r"^/accounts(?:/|$)", &[Role::Admin, Role::Accountant]),
    (
        r"^/lab/reports(?:/|$)",
        &[Role::Admin, Role::LabTechnician, Role::Receptionist],
    ),
    (r"^/lab(?:/|$)", &[Role::Admin, Role::LabTechnician]),
    (r"^/inventory(?:/|$)", &[Role::Admin, Role::InventoryManager]),
];

/// Strip query and fragment, drop a trailing slash, default to `/`
pub fn normalize(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or_default().trim();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Segment-aware prefix test: `/lab` covers `/lab/x` but not `/laboratory`
pub fn has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

pub fn is_public(path: &str) -> bool {
    PUBLIC_PREFIXES.iter().any(|prefix| has_prefix(path, prefix))
}

/// Whether the offline table lets `role` open `path`
pub fn offline_allows(role: Role, path: &str) -> bool {
    OFFLINE_PREFIXES
        .iter()
        .find(|rule| has_prefix(path, rule.prefix))
        .is_some_and(|rule| rule.roles.contains(&role))
}

struct RouteRule {
    pattern: Regex,
    roles: Vec<Role>,
}

/// Regex route table
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(entries: &[(&str, &[Role])]) -> Result<Self, regex::Error> {
        let rules = entries
            .iter()
            .map(|(pattern, roles)| {
                Ok::<_, regex::Error>(RouteRule {
                    pattern: Regex::new(pattern)?,
                    roles: roles.to_vec(),
                })
            })
            .collect::<Result<_, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// The application's online table
    pub fn online() -> Result<Self, regex::Error> {
        Self::new(ONLINE_ROUTES)
    }

    /// Roles of the first rule matching `path`
    pub fn first_match(&self, path: &str) -> Option<&[Role]> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(path))
            .map(|rule| rule.roles.as_slice())
    }

    /// Unmatched paths are open to any signed-in role
    pub fn allows(&self, role: Role, path: &str) -> bool {
        self.first_match(path)
            .map_or(true, |roles| roles.contains(&role))
    }
}
