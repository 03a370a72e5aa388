use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use http::{HeaderMap, Method};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::DispatchResult;
use crate::error::DispatchError;
use crate::response::HttpResponse;
use crate::util::lock_unpoisoned;

/// How a request picks its deduplication key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DedupeKey {
    /// Derive a key for GET, HEAD and OPTIONS; other methods are never deduplicated.
    #[default]
    Derive,
    Explicit(String),
    Disabled,
}

impl DedupeKey {
    pub(crate) fn resolve(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Option<String> {
        match self {
            Self::Explicit(key) => Some(key.clone()),
            Self::Disabled => None,
            Self::Derive => derive_key(method, url, headers, body),
        }
    }
}

/// Method and url on the first line, one `name:value` line per header in
/// sorted order, then the body. Values are byte-escaped, so no raw newline
/// appears inside a field and distinct bytes never share a key.
fn derive_key(method: &Method, url: &Url, headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return None;
    }

    let mut header_pairs: Vec<(&str, &[u8])> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes()))
        .collect();
    header_pairs.sort_unstable();

    let mut key = format!("{method} {url}\n");
    for (name, value) in header_pairs {
        key.push_str(&format!("{name}:{}\n", value.escape_ascii()));
    }
    key.push_str(&body.escape_ascii().to_string());
    Some(key)
}

pub(crate) type SharedExecution = Shared<BoxFuture<'static, DispatchResult<HttpResponse>>>;

struct InflightEntry {
    id: u64,
    execution: SharedExecution,
    waiters: usize,
    abandon: CancellationToken,
}

/// Pending keyed executions.
///
/// Each execution runs on its own task with an abandon token instead of any
/// caller's signal. Callers race their own signals; the token fires only once
/// every attached caller has detached before the execution settled, which
/// also frees the key for the next caller. A settled execution removes its
/// own entry.
#[derive(Default)]
pub(crate) struct InflightTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<String, InflightEntry>>,
}

pub(crate) struct Joined {
    pub(crate) execution: SharedExecution,
    pub(crate) is_follower: bool,
    pub(crate) attachment: Attachment,
}

/// One caller's hold on a pending execution. Dropping it detaches the caller.
pub(crate) struct Attachment {
    table: Weak<InflightTable>,
    key: String,
    id: u64,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.detach(&self.key, self.id);
        }
    }
}

impl InflightTable {
    /// Joins the pending execution for `key`, or starts `work` on its own task
    /// and registers it. `work` receives the abandon token.
    pub(crate) fn run_or_join<W, F>(
        self: &Arc<Self>,
        key: String,
        method: &Method,
        uri: &str,
        work: W,
    ) -> Joined
    where
        W: FnOnce(CancellationToken) -> F,
        F: Future<Output = DispatchResult<HttpResponse>> + Send + 'static,
    {
        let mut entries = lock_unpoisoned(&self.entries);
        if let Some(entry) = entries.get_mut(&key) {
            entry.waiters += 1;
            return Joined {
                execution: entry.execution.clone(),
                is_follower: true,
                attachment: Attachment {
                    table: Arc::downgrade(self),
                    key,
                    id: entry.id,
                },
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let abandon = CancellationToken::new();
        let work = work(abandon.clone());
        let table: Weak<Self> = Arc::downgrade(self);
        let settle_key = key.clone();
        let task = tokio::spawn(async move {
            let result = work.await;
            if let Some(table) = table.upgrade() {
                table.remove(&settle_key, id);
            }
            result
        });

        let method = method.clone();
        let uri = uri.to_owned();
        let execution = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(DispatchError::ExecutionAborted {
                    method,
                    uri,
                    message: join_error.to_string(),
                }),
            }
        }
        .boxed()
        .shared();

        entries.insert(
            key.clone(),
            InflightEntry {
                id,
                execution: execution.clone(),
                waiters: 1,
                abandon,
            },
        );
        Joined {
            execution,
            is_follower: false,
            attachment: Attachment {
                table: Arc::downgrade(self),
                key,
                id,
            },
        }
    }

#[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    fn detach(&self, key: &str, id: u64) {
        let mut entries = lock_unpoisoned(&self.entries);
        let Some(entry) = entries.get_mut(key).filter(|entry| entry.id == id) else {
            return;
        };
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters == 0
            && let Some(entry) = entries.remove(key)
        {
            drop(entries);
            entry.abandon.cancel();
        }
    }

    fn remove(&self, key: &str, id: u64) {
        let mut entries = lock_unpoisoned(&self.entries);
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderValue, StatusCode};

    use super::*;

    fn url(text: &str) -> Url {
        Url::parse(text).expect("test url")
    }

    #[test]
    fn derived_key_ignores_header_order() {
        let target = url("https://api.audit.8333.space/mints?limit=10");
        let mut first = HeaderMap::new();
        first.insert("accept", HeaderValue::from_static("application/json"));
        first.insert("x-client", HeaderValue::from_static("kym"));
        let mut second = HeaderMap::new();
        second.insert("x-client", HeaderValue::from_static("kym"));
        second.insert("accept", HeaderValue::from_static("application/json"));

        let a = DedupeKey::Derive.resolve(&Method::GET, &target, &first, b"");
        let b = DedupeKey::Derive.resolve(&Method::GET, &target, &second, b"");
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn derived_key_separates_method_url_and_body() {
        let target = url("https://mint.example/v1/info");
        let headers = HeaderMap::new();
        let get = DedupeKey::Derive.resolve(&Method::GET, &target, &headers, b"");
        let head = DedupeKey::Derive.resolve(&Method::HEAD, &target, &headers, b"");
        let other = DedupeKey::Derive.resolve(
            &Method::GET,
            &url("https://mint.example/v1/keys"),
            &headers,
            b"",
        );
        let with_body = DedupeKey::Derive.resolve(&Method::OPTIONS, &target, &headers, b"x");
        assert_ne!(get, head);
        assert_ne!(get, other);
        assert!(with_body.is_some_and(|key| key.ends_with("\nx")));
    }

    #[test]
    fn derived_key_keeps_non_utf8_bytes_apart() {
        let target = url("https://a.example/q");
        let headers = HeaderMap::new();
        let ff = DedupeKey::Derive.resolve(&Method::GET, &target, &headers, &[0xff]);
        let fe = DedupeKey::Derive.resolve(&Method::GET, &target, &headers, &[0xfe]);
        assert!(ff.is_some());
        assert_ne!(ff, fe);

        let mut first = HeaderMap::new();
        first.insert("x-tag", HeaderValue::from_bytes(&[0xff]).expect("opaque value"));
        let mut second = HeaderMap::new();
        second.insert("x-tag", HeaderValue::from_bytes(&[0xfe]).expect("opaque value"));
        assert_ne!(
            DedupeKey::Derive.resolve(&Method::GET, &target, &first, b""),
            DedupeKey::Derive.resolve(&Method::GET, &target, &second, b"")
        );
    }

    #[test]
    fn derived_key_does_not_confuse_header_and_body_bytes() {
        let target = url("https://a.example/q");
        let mut spaced = HeaderMap::new();
        spaced.insert("x-tag", HeaderValue::from_static("x y"));
        let mut plain = HeaderMap::new();
        plain.insert("x-tag", HeaderValue::from_static("x"));
        assert_ne!(
            DedupeKey::Derive.resolve(&Method::GET, &target, &spaced, b"z"),
            DedupeKey::Derive.resolve(&Method::GET, &target, &plain, b"y z")
        );
        assert_ne!(
            DedupeKey::Derive.resolve(&Method::GET, &target, &plain, b""),
            DedupeKey::Derive.resolve(&Method::GET, &target, &HeaderMap::new(), b"x-tag:x")
        );
    }

    #[test]
    fn unsafe_methods_derive_no_key() {
        let target = url("https://mint.example/v1/mint");
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            assert_eq!(
                DedupeKey::Derive.resolve(&method, &target, &HeaderMap::new(), b"{}"),
                None
            );
        }
    }

    #[test]
    fn explicit_and_disabled_keys_are_verbatim() {
        let target = url("https://mint.example/v1/mint");
        assert_eq!(
            DedupeKey::Explicit("k1".to_owned()).resolve(
                &Method::POST,
                &target,
                &HeaderMap::new(),
                b""
            ),
            Some("k1".to_owned())
        );
        assert_eq!(
            DedupeKey::Disabled.resolve(&Method::GET, &target, &HeaderMap::new(), b""),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_joins_share_one_execution_and_entry_clears() {
        let table = Arc::new(InflightTable::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let start = |runs: Arc<AtomicUsize>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(HttpResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"ok")))
        };

        let leader = table.run_or_join("k1".to_owned(), &Method::GET, "u", |_| start(runs.clone()));
        let follower = table.run_or_join("k1".to_owned(), &Method::GET, "u", |_| start(runs.clone()));
        assert!(!leader.is_follower);
        assert!(follower.is_follower);
        assert_eq!(table.len(), 1);

        let (a, b) = tokio::join!(leader.execution, follower.execution);
        assert_eq!(a.expect("leader").body(), b.expect("follower").body());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 0);

        let later = table.run_or_join("k1".to_owned(), &Method::GET, "u", |_| start(runs.clone()));
        assert!(!later.is_follower);
        later.execution.await.expect("later run");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_execution_is_removed_too() {
        let table = Arc::new(InflightTable::default());
        let joined = table.run_or_join("k2".to_owned(), &Method::GET, "u", |_| async {
            Err(DispatchError::InvalidUri {
                uri: "bad".to_owned(),
            })
        });
        assert!(joined.execution.await.is_err());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_fires_only_after_every_caller_detaches() {
        let table = Arc::new(InflightTable::default());
        let observed = Arc::new(Mutex::new(None));
        let work = |abandon: CancellationToken| {
            let observed = Arc::clone(&observed);
            async move {
                tokio::select! {
                    () = abandon.cancelled() => {
                        *lock_unpoisoned(&observed) = Some("abandoned");
                        Err(DispatchError::InvalidUri { uri: "abandoned".to_owned() })
                    }
                    () = tokio::time::sleep(Duration::from_secs(60)) => {
                        *lock_unpoisoned(&observed) = Some("finished");
                        Ok(HttpResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::new()))
                    }
                }
            }
        };

        let leader = table.run_or_join("k3".to_owned(), &Method::GET, "u", work);
        let follower = table.run_or_join("k3".to_owned(), &Method::GET, "u", |_| async {
            Ok(HttpResponse::new(StatusCode::ACCEPTED, HeaderMap::new(), Bytes::new()))
        });
        assert!(follower.is_follower);

        drop(leader);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*lock_unpoisoned(&observed), None);
        assert_eq!(table.len(), 1);

        drop(follower);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*lock_unpoisoned(&observed), Some("abandoned"));
        assert_eq!(table.len(), 0);
    }
}
