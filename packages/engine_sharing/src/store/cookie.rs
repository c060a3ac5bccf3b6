use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::SharedStore;
use crate::error::StoreError;

/// Limit on name plus value, in bytes.
pub const MAX_COOKIE_BYTES: usize = 4096;

/// Limit on the number of cookies in one jar.
pub const MAX_COOKIES: usize = 50;

/// Fallback store with cookie semantics: a single jar file holding
/// `name=value` pairs separated by `"; "`, with per-entry size and jar-wide
/// count limits and restricted name/value alphabets.
#[derive(Debug)]
pub struct CookieStore {
    jar: PathBuf,
    lock: Mutex<()>,
}

impl CookieStore {
    pub fn new(jar: impl AsRef<Path>) -> Self {
        Self {
            jar: jar.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<(String, String)>, StoreError> {
        let raw = match fs::read_to_string(&self.jar) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_jar(&raw))
    }

    fn save(&self, cookies: &[(String, String)]) -> Result<(), StoreError> {
        let body = cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        if let Some(parent) = self.jar.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.jar.with_extension(format!("{}.tmp", std::process::id()));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.jar)?;
        Ok(())
    }
}

fn parse_jar(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c))
}

// RFC 6265 cookie-octet
fn valid_value(value: &str) -> bool {
    value.bytes().all(|b| {
        matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
    })
}

impl SharedStore for CookieStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self
            .load()?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if !valid_name(key) {
            return Err(StoreError::KeyRejected(key.to_string()));
        }
        if !valid_value(value) {
            return Err(StoreError::ValueRejected(key.to_string()));
        }
        let len = key.len() + value.len();
        if len > MAX_COOKIE_BYTES {
            return Err(StoreError::ValueTooLarge {
                key: key.to_string(),
                len,
                limit: MAX_COOKIE_BYTES,
            });
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut cookies = self.load()?;
        match cookies.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => {
                if cookies.len() >= MAX_COOKIES {
                    return Err(StoreError::Full(cookies.len()));
                }
                cookies.push((key.to_string(), value.to_string()));
            }
        }
        self.save(&cookies)
    }

    fn clean(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut cookies = self.load()?;
        let before = cookies.len();
        cookies.retain(|(k, _)| k != key);
        if cookies.len() != before {
            self.save(&cookies)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.into_iter().map(|(k, _)| k).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jar() -> (tempfile::TempDir, CookieStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path().join("jar"));
        (dir, store)
    }

    #[test]
    fn stores_presence_shaped_values() {
        let (_dir, store) = jar();
        store
            .write("esh.3_app1", "1700000000000|esh-3|example.com|b1|https|NONE")
            .unwrap();
        store.write("esh.app1", "|3|").unwrap();
        assert_eq!(store.read("esh.app1").unwrap().as_deref(), Some("|3|"));
        assert_eq!(store.keys().unwrap().len(), 2);

        store.write("esh.app1", "|3|4|").unwrap();
        assert_eq!(store.read("esh.app1").unwrap().as_deref(), Some("|3|4|"));
        assert_eq!(store.keys().unwrap().len(), 2);
    }

    #[test]
    fn enforces_size_limit() {
        let (_dir, store) = jar();
        let big = "x".repeat(MAX_COOKIE_BYTES);
        assert!(matches!(
            store.write("k", &big),
            Err(StoreError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn enforces_alphabets() {
        let (_dir, store) = jar();
        assert!(matches!(
            store.write("bad name", "v"),
            Err(StoreError::KeyRejected(_))
        ));
        assert!(matches!(
            store.write("k", "a;b"),
            Err(StoreError::ValueRejected(_))
        ));
    }

    #[test]
    fn enforces_jar_capacity() {
        let (_dir, store) = jar();
        for i in 0..MAX_COOKIES {
            store.write(&format!("k{}", i), "v").unwrap();
        }
        assert!(matches!(store.write("overflow", "v"), Err(StoreError::Full(_))));
        // Overwriting an existing cookie is still fine.
        store.write("k0", "w").unwrap();
    }

    #[test]
    fn clean_removes_only_target() {
        let (_dir, store) = jar();
        store.write("a", "1").unwrap();
        store.write("b", "2").unwrap();
        store.clean("a").unwrap();
        store.clean("missing").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
    }
}
