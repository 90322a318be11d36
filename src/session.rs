//! Session key, connect string and handshake authentication tags.
//!
//! A session is described by a connect string:
//! ```text
//! pipehub://master@vis01.example.org:31093/9f86d081884c7d65...
//! pipehub://slave@vis01.example.org:31093/9f86d081884c7d65...
//! ```
//!
//! The trailing hex blob is the shared session key. Every peer proves it
//! knows the key by answering the hub's nonce with
//! `hex(HMAC-SHA256(key, nonce ":" identity))`.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use rand_core::{OsRng, RngCore};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{config::Config, error::AppError, protocol::Identity};

const SCHEME: &str = "pipehub://";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
        }
    }
}

/// Parsed `pipehub://<role>@<host>:<port>/<key>` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectString {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub key: String,
}

impl fmt::Display for ConnectString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}{}@{}:{}/{}",
            self.role.as_str(),
            self.host,
            self.port,
            self.key
        )
    }
}

impl FromStr for ConnectString {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| AppError::Session(format!("invalid connect string '{s}': {why}"));

        let rest = s.strip_prefix(SCHEME).ok_or_else(|| bad("missing scheme"))?;
        let (role, rest) = rest.split_once('@').ok_or_else(|| bad("missing role"))?;
        let role = match role {
            "master" => Role::Master,
            "slave" => Role::Slave,
            other => return Err(bad(&format!("unknown role '{other}'"))),
        };
        let (addr, key) = rest.split_once('/').ok_or_else(|| bad("missing session key"))?;
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
        if host.is_empty() {
            return Err(bad("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| bad("port is not a number"))?;
        if key.is_empty() || hex::decode(key).is_err() {
            return Err(bad("session key must be hex"));
        }

        Ok(ConnectString {
            role,
            host: host.to_string(),
            port,
            key: key.to_string(),
        })
    }
}

/// Shared secret used for handshake tags.
#[derive(Clone)]
pub struct SessionKey(String);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn from_hex(key: &str) -> Result<Self, AppError> {
        hex::decode(key).map_err(|e| AppError::Session(format!("session key is not hex: {e}")))?;
        Ok(Self(key.to_ascii_lowercase()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    fn keyed(&self, nonce: &str, identity: Identity) -> Option<HmacSha256> {
        let key = hex::decode(&self.0).ok()?;
        let mut mac = HmacSha256::new_from_slice(&key).ok()?;
        mac.update(nonce.as_bytes());
        mac.update(b":");
        mac.update(identity.as_str().as_bytes());
        Some(mac)
    }

    /// Tag proving knowledge of the key for `nonce` and `identity`.
    pub fn mac(&self, nonce: &str, identity: Identity) -> String {
        self.keyed(nonce, identity)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default()
    }

    pub fn verify(&self, nonce: &str, identity: Identity, mac: &str) -> bool {
        let Ok(tag) = hex::decode(mac) else {
            return false;
        };
        self.keyed(nonce, identity)
            .is_some_and(|expected| expected.verify_slice(&tag).is_ok())
    }
}

/// Fresh random challenge for the identity handshake.
pub fn nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Resolved session for this process.
#[derive(Debug, Clone)]
pub struct Session {
    pub role: Role,
    pub key: SessionKey,
    /// Master to join, for slaves.
    pub master: Option<(String, u16)>,
}

impl Session {
    /// Build the session from an optional connect string and key override.
    ///
    /// Without a connect string this hub is the master and uses the override
    /// key or a freshly generated one.
    pub fn setup(connect: Option<&ConnectString>, key_override: Option<&str>) -> Result<Self, AppError> {
        match connect {
            Some(cs) if cs.role == Role::Slave => Ok(Session {
                role: Role::Slave,
                key: SessionKey::from_hex(&cs.key)?,
                master: Some((cs.host.clone(), cs.port)),
            }),
            Some(cs) => Ok(Session {
                role: Role::Master,
                key: SessionKey::from_hex(&cs.key)?,
                master: None,
            }),
            None => Ok(Session {
                role: Role::Master,
                key: match key_override {
                    Some(k) => SessionKey::from_hex(k)?,
                    None => SessionKey::generate(),
                },
                master: None,
            }),
        }
    }

    /// Connect string a slave uses to join this master.
    pub fn slave_connect_string(&self, host: &str, port: u16) -> ConnectString {
        ConnectString {
            role: Role::Slave,
            host: host.to_string(),
            port,
            key: self.key.as_hex().to_string(),
        }
    }
}

/// Write the slave connect string to `work_dir/session` (mode 0600).
pub fn persist(config: &Config, connect: &ConnectString) -> Result<PathBuf, AppError> {
    fs::create_dir_all(&config.work_dir)
        .map_err(|e| AppError::Session(format!("cannot create work dir: {e}")))?;
    let path = session_file(&config.work_dir);
    fs::write(&path, format!("{connect}\n"))
        .map_err(|e| AppError::Session(format!("cannot write {}: {e}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| AppError::Session(format!("cannot set permissions on session file: {e}")))?;
    }

    Ok(path)
}

pub fn session_file(work_dir: &Path) -> PathBuf {
    work_dir.join("session")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn connect_string_round_trips() {
        let cs: ConnectString = "pipehub://slave@vis01:31093/00ff".parse().unwrap();
        assert_eq!(cs.role, Role::Slave);
        assert_eq!(cs.host, "vis01");
        assert_eq!(cs.port, 31093);
        assert_eq!(cs.to_string(), "pipehub://slave@vis01:31093/00ff");
    }

    #[test]
    fn connect_string_rejects_garbage() {
        for bad in [
            "http://master@h:1/00",
            "pipehub://boss@h:1/00",
            "pipehub://master@h/00",
            "pipehub://master@:1/00",
            "pipehub://master@h:port/00",
            "pipehub://master@h:1/zz",
            "pipehub://master@h:1",
        ] {
            assert!(bad.parse::<ConnectString>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn mac_binds_nonce_and_identity() {
        let key = SessionKey::generate();
        let n = nonce();
        let tag = key.mac(&n, Identity::SlaveHub);
        assert!(key.verify(&n, Identity::SlaveHub, &tag));
        assert!(!key.verify(&n, Identity::Manager, &tag));
        assert!(!key.verify(&nonce(), Identity::SlaveHub, &tag));

        let other = SessionKey::generate();
        assert!(!other.verify(&n, Identity::SlaveHub, &tag));
        assert!(!key.verify(&n, Identity::SlaveHub, ""));
        assert!(!key.verify(&n, Identity::SlaveHub, &tag[..32]));
        assert!(!key.verify(&n, Identity::SlaveHub, "not hex"));
    }

    #[test]
    fn mac_is_hmac_sha256_over_the_raw_key() {
        let key = SessionKey::from_hex(&hex::encode("Jefe")).unwrap();
        let mut mac = HmacSha256::new_from_slice(b"Jefe").unwrap();
        mac.update(b"n0nce:manager");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(key.mac("n0nce", Identity::Manager), expected);
        assert_eq!(expected.len(), 64);
    }

    #[test]
    fn setup_without_connect_string_is_master() {
        let s = Session::setup(None, Some("abcd")).unwrap();
        assert_eq!(s.role, Role::Master);
        assert_eq!(s.key.as_hex(), "abcd");
        assert!(s.master.is_none());
    }

    #[test]
    fn setup_from_slave_connect_string() {
        let cs: ConnectString = "pipehub://slave@head:4000/beef".parse().unwrap();
        let s = Session::setup(Some(&cs), None).unwrap();
        assert_eq!(s.role, Role::Slave);
        assert_eq!(s.master, Some(("head".to_string(), 4000)));
        assert_eq!(s.key.as_hex(), "beef");
    }

    #[test]
    fn persist_writes_private_file() {
        let tmp = TempDir::new().unwrap();
        let config = Config::test_default(tmp.path());
        let s = Session::setup(None, None).unwrap();
        let cs = s.slave_connect_string("head", 31093);
        let path = persist(&config, &cs).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), cs.to_string());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
