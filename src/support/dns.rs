//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailauth.
//
// Mailauth is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailauth is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailauth. If not, see <http://www.gnu.org/licenses/>.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::Rc;

use log::debug;
use thiserror::Error;

pub use hickory_resolver::Name;

/// The record types the evaluators ever ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    Txt,
    A,
    Aaaa,
    Mx,
    Ptr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxRecord {
    pub priority: u16,
    pub exchange: String,
}

/// The answer to a single lookup, shaped by the record type which was asked
/// for.
///
/// An empty list means the name exists (or not) but has no records of that
/// type; that is not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Records {
    /// Each element is one TXT record, split into its character-strings.
    Txt(Vec<Vec<String>>),
    A(Vec<Ipv4Addr>),
    Aaaa(Vec<Ipv6Addr>),
    Mx(Vec<MxRecord>),
    Ptr(Vec<String>),
}

impl Records {
    /// Returns an empty answer of the given type.
    pub fn empty(record_type: RecordType) -> Self {
        match record_type {
            RecordType::Txt => Self::Txt(Vec::new()),
            RecordType::A => Self::A(Vec::new()),
            RecordType::Aaaa => Self::Aaaa(Vec::new()),
            RecordType::Mx => Self::Mx(Vec::new()),
            RecordType::Ptr => Self::Ptr(Vec::new()),
        }
    }
}

/// Reasons a lookup did not produce an answer.
///
/// All of these are treated as temporary failures by the callers.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("DNS query timed out")]
    Timeout,
    #[error("DNS server failure")]
    ServerFailure,
    #[error("malformed DNS response")]
    Malformed,
    #[error("DNS error: {0}")]
    Other(String),
}

/// The capability to answer DNS queries.
///
/// `name` is given without a trailing dot. PTR queries are made against the
/// reverse name (see `reverse_name`).
pub trait Resolver {
    fn lookup(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> impl Future<Output = Result<Records, ResolveError>>;
}

/// Adapts a plain function into a `Resolver` which answers immediately.
///
/// This is mainly useful for stub resolvers.
pub struct FnResolver<F>(pub F);

impl<F> Resolver for FnResolver<F>
where
    F: Fn(&str, RecordType) -> Result<Records, ResolveError>,
{
    fn lookup(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> impl Future<Output = Result<Records, ResolveError>> {
        std::future::ready((self.0)(name, record_type))
    }
}

/// A `Resolver` backed by a real `hickory_resolver` instance.
pub struct HickoryResolver {
    inner: hickory_resolver::TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new(inner: hickory_resolver::TokioAsyncResolver) -> Self {
        Self { inner }
    }

    /// Creates a resolver using the system configuration (i.e.
    /// `/etc/resolv.conf` on UNIX).
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
            .map(Self::new)
            .map_err(|e| ResolveError::Other(e.to_string()))
    }
}

impl Resolver for HickoryResolver {
    async fn lookup(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> Result<Records, ResolveError> {
        use hickory_resolver::proto::rr::{RData, RecordType as Rt};

        let mut name =
            Name::from_ascii(name).map_err(|_| ResolveError::Malformed)?;
        // Never consult the search domains.
        name.set_fqdn(true);

        let result = match record_type {
            RecordType::Txt => self.inner.txt_lookup(name).await.map(|r| {
                Records::Txt(
                    r.iter()
                        .map(|txt| {
                            txt.iter()
                                .map(|part| {
                                    String::from_utf8_lossy(part).into_owned()
                                })
                                .collect()
                        })
                        .collect(),
                )
            }),

            RecordType::A => self
                .inner
                .ipv4_lookup(name)
                .await
                .map(|r| Records::A(r.iter().map(|a| a.0).collect())),

            RecordType::Aaaa => self
                .inner
                .ipv6_lookup(name)
                .await
                .map(|r| Records::Aaaa(r.iter().map(|a| a.0).collect())),

            RecordType::Mx => self.inner.mx_lookup(name).await.map(|r| {
                Records::Mx(
                    r.iter()
                        .map(|mx| MxRecord {
                            priority: mx.preference(),
                            exchange: mx.exchange().to_ascii(),
                        })
                        .collect(),
                )
            }),

            RecordType::Ptr => {
                self.inner.lookup(name, Rt::PTR).await.map(|r| {
                    Records::Ptr(
                        r.iter()
                            .filter_map(|rdata| match *rdata {
                                RData::PTR(ref ptr) => Some(ptr.0.to_ascii()),
                                _ => None,
                            })
                            .collect(),
                    )
                })
            },
        };

        match result {
            Ok(records) => Ok(records),
            Err(e) => {
                use hickory_resolver::error::ResolveErrorKind as Rek;

                match *e.kind() {
                    Rek::NoRecordsFound { .. } => {
                        Ok(Records::empty(record_type))
                    },
                    Rek::Timeout => Err(ResolveError::Timeout),
                    _ => Err(ResolveError::Other(e.to_string())),
                }
            },
        }
    }
}

/// Returns the name under `in-addr.arpa` or `ip6.arpa` used to look up the
/// PTR records of `ip`.
pub fn reverse_name(ip: IpAddr) -> String {
    let mut s = String::with_capacity(72);
    match ip {
        IpAddr::V4(ip) => {
            let [a, b, c, d] = ip.octets();
            let _ = write!(s, "{d}.{c}.{b}.{a}.in-addr.arpa");
        },
        IpAddr::V6(ip) => {
            for octet in ip.octets().into_iter().rev() {
                let _ = write!(s, "{:x}.{:x}.", octet & 0xF, octet >> 4);
            }
            s.push_str("ip6.arpa");
        },
    }

    s
}

/// A cache of DNS records used by SPF evaluation.
///
/// The evaluator creates entries with status `New` as it discovers them.
/// `resolve_new` is responsible for actually fetching them.
#[derive(Debug, Default)]
pub struct Cache {
    pub name_intern: HashMap<String, Rc<Name>>,
    pub a: CacheMap<Vec<Ipv4Addr>>,
    pub aaaa: CacheMap<Vec<Ipv6Addr>>,
    pub txt: CacheMap<Vec<Rc<str>>>,
    pub mx: CacheMap<Vec<Rc<Name>>>,
    pub ptr: HashMap<IpAddr, Entry<Vec<Rc<Name>>>>,
}

// These are association lists instead of hash maps because <Name as Hash>
// allocates like there's no tomorrow, and ultimately these won't be very big.
pub type CacheMap<T> = Vec<(Rc<Name>, Entry<T>)>;

/// An entry in the DNS cache passed to the SPF evaluator.
#[derive(Debug)]
pub enum Entry<T> {
    /// The query succeeded, and these are its results. Never empty.
    Ok(T),
    /// The query succeeded and returned no results.
    NotFound,
    /// The query failed.
    Error,
    /// The evaluator newly discovered the need for this query.
    New,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheError {
    NotFound,
    Error,
    NotReady,
}

pub trait MaybeBorrowedName {
    fn as_dns_name_ref(&self) -> &Name;
    fn into_rc_dns_name(self) -> Rc<Name>;
}

impl MaybeBorrowedName for &Name {
    fn as_dns_name_ref(&self) -> &Name {
        self
    }

    fn into_rc_dns_name(self) -> Rc<Name> {
        Rc::new(self.clone())
    }
}

impl MaybeBorrowedName for Rc<Name> {
    fn as_dns_name_ref(&self) -> &Name {
        self
    }

    fn into_rc_dns_name(self) -> Rc<Name> {
        self
    }
}

impl MaybeBorrowedName for &Rc<Name> {
    fn as_dns_name_ref(&self) -> &Name {
        self
    }

    fn into_rc_dns_name(self) -> Rc<Name> {
        Rc::clone(self)
    }
}

/// Look `name` up in `cache`.
///
/// If `name` is not in the cache, put it into the `New` status and return
/// `NotReady`.
pub fn look_up<T>(
    cache: &mut CacheMap<T>,
    name: impl MaybeBorrowedName,
) -> Result<&T, CacheError> {
    // Work around https://github.com/rust-lang/rust/issues/54663
    let position = cache.iter().position(|e| &*e.0 == name.as_dns_name_ref());
    if let Some(position) = position {
        match cache[position].1 {
            Entry::Ok(ref v) => Ok(v),
            Entry::NotFound => Err(CacheError::NotFound),
            Entry::Error => Err(CacheError::Error),
            Entry::New => Err(CacheError::NotReady),
        }
    } else {
        cache.push((name.into_rc_dns_name(), Entry::New));
        Err(CacheError::NotReady)
    }
}

/// Look up the PTR records of `ip` in `cache`, with the same semantics as
/// `look_up`.
pub fn ptr(
    cache: &mut HashMap<IpAddr, Entry<Vec<Rc<Name>>>>,
    ip: IpAddr,
) -> Result<&'_ [Rc<Name>], CacheError> {
    match *cache.entry(ip).or_insert(Entry::New) {
        Entry::Ok(ref v) => Ok(v),
        Entry::NotFound => Err(CacheError::NotFound),
        Entry::Error => Err(CacheError::Error),
        Entry::New => Err(CacheError::NotReady),
    }
}

/// Parses `s` into a DNS name, reusing a previous parse of the same text if
/// there is one.
pub fn intern_domain(
    cache: &mut HashMap<String, Rc<Name>>,
    s: Cow<'_, str>,
) -> Result<Rc<Name>, ()> {
    if let Some(name) = cache.get(&*s) {
        return Ok(Rc::clone(name));
    }

    let name = Name::from_ascii(&*s).map(Rc::new).map_err(|_| ())?;
    cache.insert(s.into_owned(), Rc::clone(&name));
    Ok(name)
}

impl Cache {
    pub fn intern_domain(&mut self, s: Cow<'_, str>) -> Result<Rc<Name>, ()> {
        intern_domain(&mut self.name_intern, s)
    }

    /// Returns whether any entry is still waiting to be looked up.
    #[cfg(test)]
    pub fn has_new(&self) -> bool {
        fn any_new<T>(map: &CacheMap<T>) -> bool {
            map.iter().any(|e| matches!(e.1, Entry::New))
        }

        any_new(&self.a)
            || any_new(&self.aaaa)
            || any_new(&self.txt)
            || any_new(&self.mx)
            || self.ptr.values().any(|e| matches!(*e, Entry::New))
    }
}

enum QueryKey {
    Name(Rc<Name>),
    Ptr(IpAddr),
}

struct Query {
    key: QueryKey,
    name: String,
    record_type: RecordType,
}

fn collect_new<T>(
    map: &CacheMap<T>,
    record_type: RecordType,
    out: &mut Vec<Query>,
) {
    for (name, _) in map.iter().filter(|e| matches!(e.1, Entry::New)) {
        out.push(Query {
            key: QueryKey::Name(Rc::clone(name)),
            name: query_name(name),
            record_type,
        });
    }
}

fn query_name(name: &Name) -> String {
    let mut s = name.to_ascii();
    if s.ends_with('.') {
        s.pop();
    }
    s
}

/// Looks up every `New` entry in `cache` through `resolver`, concurrently,
/// and stores the answers.
///
/// Returns the number of lookups performed.
pub async fn resolve_new(cache: &mut Cache, resolver: &impl Resolver) -> usize {
    let mut queries = Vec::<Query>::new();
    collect_new(&cache.txt, RecordType::Txt, &mut queries);
    collect_new(&cache.a, RecordType::A, &mut queries);
    collect_new(&cache.aaaa, RecordType::Aaaa, &mut queries);
    collect_new(&cache.mx, RecordType::Mx, &mut queries);
    for (&ip, _) in cache.ptr.iter().filter(|e| matches!(*e.1, Entry::New)) {
        queries.push(Query {
            key: QueryKey::Ptr(ip),
            name: reverse_name(ip),
            record_type: RecordType::Ptr,
        });
    }

    if queries.is_empty() {
        return 0;
    }

    let answers = futures::future::join_all(
        queries
            .iter()
            .map(|q| resolver.lookup(&q.name, q.record_type)),
    )
    .await;

    let count = queries.len();
    for (query, answer) in queries.into_iter().zip(answers) {
        if let Err(ref e) = answer {
            debug!(
                "{:?} lookup of {} failed: {}",
                query.record_type, query.name, e,
            );
        }
        cache.store(query, answer);
    }

    count
}

impl Cache {
    fn store(&mut self, query: Query, answer: Result<Records, ResolveError>) {
        fn set<T>(map: &mut CacheMap<T>, name: &Rc<Name>, entry: Entry<T>) {
            if let Some(existing) = map.iter_mut().find(|e| *name == e.0) {
                existing.1 = entry;
            }
        }

        fn to_entry<T>(v: Vec<T>) -> Entry<Vec<T>> {
            if v.is_empty() {
                Entry::NotFound
            } else {
                Entry::Ok(v)
            }
        }

        fn to_names(names: impl IntoIterator<Item = String>) -> Vec<Rc<Name>> {
            names
                .into_iter()
                .filter_map(|n| match Name::from_ascii(&n) {
                    Ok(name) => Some(Rc::new(name)),
                    Err(e) => {
                        debug!("ignoring invalid name {:?}: {}", n, e);
                        None
                    },
                })
                .collect()
        }

        match query.key {
            QueryKey::Ptr(ip) => {
                let entry = match answer {
                    Ok(Records::Ptr(names)) => to_entry(to_names(names)),
                    Ok(_) | Err(_) => Entry::Error,
                };
                self.ptr.insert(ip, entry);
            },

            QueryKey::Name(ref name) => match (query.record_type, answer) {
                (RecordType::Txt, Ok(Records::Txt(txts))) => set(
                    &mut self.txt,
                    name,
                    to_entry(
                        txts.into_iter()
                            .map(|parts| Rc::from(parts.concat()))
                            .collect(),
                    ),
                ),
                (RecordType::A, Ok(Records::A(addrs))) => {
                    set(&mut self.a, name, to_entry(addrs))
                },
                (RecordType::Aaaa, Ok(Records::Aaaa(addrs))) => {
                    set(&mut self.aaaa, name, to_entry(addrs))
                },
                (RecordType::Mx, Ok(Records::Mx(mut mxs))) => {
                    mxs.sort_by_key(|mx| mx.priority);
                    set(
                        &mut self.mx,
                        name,
                        to_entry(to_names(
                            mxs.into_iter().map(|mx| mx.exchange),
                        )),
                    )
                },

                (RecordType::Txt, _) => set(&mut self.txt, name, Entry::Error),
                (RecordType::A, _) => set(&mut self.a, name, Entry::Error),
                (RecordType::Aaaa, _) => {
                    set(&mut self.aaaa, name, Entry::Error)
                },
                (RecordType::Mx, _) => set(&mut self.mx, name, Entry::Error),
                (RecordType::Ptr, _) => {},
            },
        }
    }
}
