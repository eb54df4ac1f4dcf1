use std::fmt;
use std::str::FromStr;

/// XMPP address (`local@domain/resource`).
///
/// OMEMO state is keyed by the bare form; the resource is kept only so
/// callers can round-trip full JIDs from stanzas.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    pub local: String,
    pub domain: String,
    pub resource: Option<String>,
}

impl Jid {
    /// New bare JID (local@domain).
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
            resource: None,
        }
    }

    /// New full JID (local@domain/resource).
    pub fn new_full(
        local: impl Into<String>,
        domain: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
            resource: Some(resource.into()),
        }
    }

    /// Domain-only JID (no local part).
    pub fn domain(domain: impl Into<String>) -> Self {
        Self::new("", domain)
    }

    /// JID without resource.
    pub fn to_bare(&self) -> Self {
        Self {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.domain.is_empty()
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (rest, resource) = match s.split_once('/') {
            Some((r, res)) if !res.is_empty() => (r, Some(res.to_string())),
            Some(_) => return Err(JidParseError),
            None => (s, None),
        };
        let parts: Vec<&str> = rest.split('@').collect();
        let (local, domain) = match parts.as_slice() {
            [domain] => ("", *domain),
            [local, domain] if !local.is_empty() => (*local, *domain),
            _ => return Err(JidParseError),
        };
        if domain.is_empty() {
            return Err(JidParseError);
        }
        Ok(Self {
            local: local.to_string(),
            domain: domain.to_string(),
            resource,
        })
    }
}

#[derive(Debug)]
pub struct JidParseError;

impl fmt::Display for JidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid JID format")
    }
}

impl std::error::Error for JidParseError {}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.local.is_empty() {
            write!(f, "{}@{}", self.local, self.domain)?;
        } else {
            write!(f, "{}", self.domain)?;
        }
        if let Some(res) = &self.resource {
            write!(f, "/{}", res)?;
        }
        Ok(())
    }
}

impl serde::Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Jid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jid_new_and_display() {
        let j = Jid::new("alice", "example.org");
        assert_eq!(j.to_string(), "alice@example.org");
        assert!(j.is_bare());
        assert!(!j.is_empty());
    }

    #[test]
    fn jid_parse_full() {
        let j: Jid = "alice@example.org/phone".parse().unwrap();
        assert_eq!(j.local, "alice");
        assert_eq!(j.domain, "example.org");
        assert_eq!(j.resource.as_deref(), Some("phone"));
        assert_eq!(j.to_string(), "alice@example.org/phone");
        assert_eq!(j.to_bare(), Jid::new("alice", "example.org"));
    }

    #[test]
    fn jid_parse_domain_only() {
        let j: Jid = "conference.example.org".parse().unwrap();
        assert_eq!(j.local, "");
        assert_eq!(j.to_string(), "conference.example.org");
    }

    #[test]
    fn jid_parse_rejects_garbage() {
        assert!("a@b@c".parse::<Jid>().is_err());
        assert!("@example.org".parse::<Jid>().is_err());
        assert!("alice@example.org/".parse::<Jid>().is_err());
        assert!("alice@".parse::<Jid>().is_err());
    }
}
