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


//! Evaluation of SPF policies against a DNS cache.
//!
//! A pass of the evaluator never waits for DNS. When it needs a record that
//! is not in the cache yet, it adds a `New` entry and abandons the pass; the
//! driver resolves the new entries and starts another pass. All counters are
//! rebuilt from zero on every pass, so mechanisms are always evaluated in
//! order.

use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::rc::Rc;

use chrono::prelude::*;
use hickory_resolver::Name as DnsName;

use super::macros;
use super::syntax as s;
use crate::support::cidr;
use crate::support::dns::{self, look_up, Cache, CacheError};
use crate::support::system_config::SpfConfig;

/// RFC 7208 § 2.6
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl SpfResult {
    /// The qualifier character which produces this result, for the four
    /// results a directive can produce.
    pub fn qualifier(self) -> Option<char> {
        match self {
            Self::Pass => Some('+'),
            Self::Fail => Some('-'),
            Self::SoftFail => Some('~'),
            Self::Neutral => Some('?'),
            Self::None | Self::TempError | Self::PermError => None,
        }
    }
}

impl From<s::Qualifier> for SpfResult {
    fn from(q: s::Qualifier) -> Self {
        match q {
            s::Qualifier::Pass => Self::Pass,
            s::Qualifier::Fail => Self::Fail,
            s::Qualifier::SoftFail => Self::SoftFail,
            s::Qualifier::Neutral => Self::Neutral,
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::None => "none",
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        })
    }
}

/// The explanation a domain may publish for a `fail` result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Explanation {
    /// There is no explanation, and never will be.
    None,
    /// The explanation depends on DNS records not yet in the cache.
    NotReady,
    Some(String),
}

/// The outcome of a pass which reached a conclusion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evaluation {
    pub result: SpfResult,
    /// The text of the directive which matched, if any.
    pub mechanism: Option<String>,
    pub explanation: Explanation,
}

/// What is known about the message and client being checked.
pub struct Context<'a> {
    /// The `MAIL FROM` address. `None` stands for `postmaster@` followed by
    /// `sender_domain`.
    pub sender: Option<Cow<'a, str>>,
    /// The local part of `sender`. `None` stands for `postmaster`.
    pub sender_local: Option<Cow<'a, str>>,
    /// The domain of the sender, or the `HELO` domain if there is no sender.
    pub sender_domain: Cow<'a, str>,
    /// The domain whose policy is evaluated first.
    pub spf_domain: Rc<DnsName>,
    pub helo_domain: Cow<'a, str>,
    /// The client address. IPv4-mapped IPv6 addresses must already have been
    /// converted to IPv4.
    pub ip: IpAddr,
    /// Substituted for `%{r}`.
    pub receiver_host: Cow<'a, str>,
    /// Substituted for `%{t}`.
    pub now: DateTime<Utc>,
}

/// The reasons a mechanism can fail to produce a match decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Abort {
    /// Needs DNS records which aren't in the cache yet.
    Pending,
    Temp,
    Perm,
}

impl Abort {
    /// Converts into the conclusion of a `check_host`, or `None` if the pass
    /// has to be abandoned.
    fn conclude(self) -> Option<Conclusion> {
        match self {
            Self::Pending => None,
            Self::Temp => Some(Conclusion::bare(SpfResult::TempError)),
            Self::Perm => Some(Conclusion::bare(SpfResult::PermError)),
        }
    }
}

struct Conclusion {
    result: SpfResult,
    matched: Option<String>,
    /// The domain and record of the directive which decided the result. The
    /// explanation, if any, comes from this record.
    origin: Option<(Rc<DnsName>, Rc<str>)>,
}

impl Conclusion {
    fn bare(result: SpfResult) -> Self {
        Self {
            result,
            matched: None,
            origin: None,
        }
    }
}

struct Evaluator<'e> {
    ctx: &'e Context<'e>,
    config: &'e SpfConfig,
    /// Mechanisms and modifiers which cause DNS queries, excluding the
    /// secondary queries made by `mx` and `ptr`.
    dns_directives: u32,
    void_lookups: u32,
    /// Current `include`/`redirect` nesting.
    depth: u32,
    /// Whether a `ptr` mechanism has been evaluated. `%{p}` only looks for
    /// a validated name after that.
    has_ptr: bool,
}

/// Evaluates the policy of `ctx.spf_domain`.
///
/// Returns `None` if the pass was abandoned for want of DNS records, in which
/// case `dns_cache` has `New` entries for the driver to resolve before
/// calling this again. A conclusive result whose explanation is
/// `NotReady` likewise has more entries to resolve, but only the
/// explanation can still change.
pub fn eval(
    ctx: &Context<'_>,
    dns_cache: &mut Cache,
    config: &SpfConfig,
) -> Option<Evaluation> {
    let mut evaluator = Evaluator {
        ctx,
        config,
        dns_directives: 0,
        void_lookups: 0,
        depth: 0,
        has_ptr: false,
    };
    let conclusion =
        evaluator.check_host(dns_cache, Rc::clone(&ctx.spf_domain))?;

    let explanation = match conclusion {
        Conclusion {
            result: SpfResult::Fail,
            origin: Some((ref domain, ref txt)),
            ..
        } => evaluator.explain(dns_cache, domain, txt),
        _ => Explanation::None,
    };

    Some(Evaluation {
        result: conclusion.result,
        mechanism: conclusion.matched,
        explanation,
    })
}

impl<'e> Evaluator<'e> {
    /// Evaluates the policy at `domain`, following redirects.
    fn check_host(
        &mut self,
        dns: &mut Cache,
        domain: Rc<DnsName>,
    ) -> Option<Conclusion> {
        let depth = self.depth;
        let conclusion = self.follow_redirects(dns, domain);
        self.depth = depth;
        conclusion
    }

    fn follow_redirects(
        &mut self,
        dns: &mut Cache,
        mut domain: Rc<DnsName>,
    ) -> Option<Conclusion> {
        let mut redirected = false;
        loop {
            let txt = match fetch_policy(dns, &domain) {
                Ok(Some(txt)) => txt,
                // RFC 7208 § 6.1: a redirect to a domain without a policy
                // is a permanent error.
                Ok(None) if redirected => {
                    return Some(Conclusion::bare(SpfResult::PermError));
                },
                Ok(None) => return Some(Conclusion::bare(SpfResult::None)),
                Err(abort) => return abort.conclude(),
            };

            let Ok(record) = s::Record::parse(&txt) else {
                return Some(Conclusion::bare(SpfResult::PermError));
            };

            for &(text, ref directive) in &record.directives {
                match self.matches(dns, &domain, &directive.mechanism) {
                    Ok(false) => {},
                    Ok(true) => {
                        return Some(Conclusion {
                            result: directive.qualifier.into(),
                            matched: Some(text.to_owned()),
                            origin: Some((domain, Rc::clone(&txt))),
                        });
                    },
                    Err(abort) => return abort.conclude(),
                }
            }

            // Nothing matched, so the redirect (if any) takes over.
            let Some(target) = record.redirect else {
                return Some(Conclusion::bare(SpfResult::Neutral));
            };

            let next = self
                .count_dns_directive()
                .and_then(|()| self.descend())
                .and_then(|()| self.target_domain(dns, &domain, Some(target)));
            match next {
                Ok(next) => domain = next,
                Err(abort) => return abort.conclude(),
            }
            redirected = true;
        }
    }

    fn matches(
        &mut self,
        dns: &mut Cache,
        domain: &Rc<DnsName>,
        mechanism: &s::Mechanism<'_>,
    ) -> Result<bool, Abort> {
        use super::syntax::Mechanism as M;

        match *mechanism {
            M::All => Ok(true),
            M::Ip(network, lengths) => Ok(cidr::ip_matches(
                self.ctx.ip,
                network,
                lengths.v4,
                lengths.v6,
            )),
            M::A(target, lengths) => {
                let host = self.dns_target(dns, domain, target)?;
                self.host_matches(dns, &host, lengths)
            },
            M::Mx(target, lengths) => {
                let host = self.dns_target(dns, domain, target)?;
                self.exchange_matches(dns, &host, lengths)
            },
            M::Ptr(target) => {
                self.has_ptr = true;
                let host = self.dns_target(dns, domain, target)?;
                validated_name(
                    dns,
                    self.ctx.ip,
                    &host,
                    self.config.max_ptr_names,
                )
                .map(|name| name.is_some())
            },
            // Always an A query, even for IPv6 clients.
            M::Exists(target) => {
                let host = self.dns_target(dns, domain, Some(target))?;
                Ok(self.void_check(look_up(&mut dns.a, &host))?.is_some())
            },
            M::Include(target) => {
                let host = self.dns_target(dns, domain, Some(target))?;
                self.include_matches(dns, host)
            },
        }
    }

    /// Counts a mechanism which queries DNS and works out which domain it
    /// queries.
    fn dns_target(
        &mut self,
        dns: &mut Cache,
        domain: &Rc<DnsName>,
        target: Option<s::MacroString<'_>>,
    ) -> Result<Rc<DnsName>, Abort> {
        self.count_dns_directive()?;
        self.target_domain(dns, domain, target)
    }

    /// Whether any address of `host` is in the same network as the client.
    fn host_matches(
        &mut self,
        dns: &mut Cache,
        host: &Rc<DnsName>,
        lengths: s::CidrLengths,
    ) -> Result<bool, Abort> {
        Ok(match self.ctx.ip {
            IpAddr::V4(ip) => self
                .void_check(look_up(&mut dns.a, host))?
                .is_some_and(|addrs| {
                    addrs
                        .iter()
                        .any(|&a| cidr::ipv4_addr_matches(ip, a, lengths.v4))
                }),
            IpAddr::V6(ip) => self
                .void_check(look_up(&mut dns.aaaa, host))?
                .is_some_and(|addrs| {
                    addrs
                        .iter()
                        .any(|&a| cidr::ipv6_addr_matches(ip, a, lengths.v6))
                }),
        })
    }

    fn exchange_matches(
        &mut self,
        dns: &mut Cache,
        domain: &Rc<DnsName>,
        lengths: s::CidrLengths,
    ) -> Result<bool, Abort> {
        let exchanges = match self.void_check(look_up(&mut dns.mx, domain))? {
            None => return Ok(false),
            // RFC 7208 § 4.6.4
            Some(names) if names.len() > self.config.max_mx_names => {
                return Err(Abort::Perm);
            },
            Some(names) => names.clone(),
        };

        // Every exchange is examined so that all their lookups go out in the
        // same pass. A temporary error only counts if nothing matches.
        let mut outcome = Ok(false);
        for exchange in &exchanges {
            match self.host_matches(dns, exchange, lengths) {
                Ok(true) => return Ok(true),
                Ok(false) => {},
                Err(Abort::Perm) => return Err(Abort::Perm),
                Err(Abort::Pending) => outcome = Err(Abort::Pending),
                Err(Abort::Temp) => {
                    if outcome.is_ok() {
                        outcome = Err(Abort::Temp);
                    }
                },
            }
        }

        outcome
    }

    /// RFC 7208 § 5.2
    fn include_matches(
        &mut self,
        dns: &mut Cache,
        target: Rc<DnsName>,
    ) -> Result<bool, Abort> {
        self.descend()?;
        let conclusion = self.check_host(dns, target);
        self.depth -= 1;

        match conclusion.map(|c| c.result) {
            None => Err(Abort::Pending),
            Some(SpfResult::Pass) => Ok(true),
            Some(
                SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral,
            ) => Ok(false),
            Some(SpfResult::TempError) => Err(Abort::Temp),
            Some(SpfResult::PermError | SpfResult::None) => Err(Abort::Perm),
        }
    }

    fn count_dns_directive(&mut self) -> Result<(), Abort> {
        self.dns_directives += 1;
        if self.dns_directives > self.config.max_dns_directives {
            Err(Abort::Perm)
        } else {
            Ok(())
        }
    }

    fn descend(&mut self) -> Result<(), Abort> {
        if self.depth >= self.config.max_depth {
            return Err(Abort::Perm);
        }

        self.depth += 1;
        Ok(())
    }

    /// Maps the cache status of a mechanism's own query.
    ///
    /// An empty answer is not an error, but only `max_void_lookups` of them
    /// are tolerated (RFC 7208 § 4.6.4).
    fn void_check<T>(
        &mut self,
        lookup: Result<T, CacheError>,
    ) -> Result<Option<T>, Abort> {
        match lookup {
            Ok(answer) => Ok(Some(answer)),
            Err(CacheError::NotReady) => Err(Abort::Pending),
            Err(CacheError::Error) => Err(Abort::Temp),
            Err(CacheError::NotFound) => {
                self.void_lookups += 1;
                if self.void_lookups > self.config.max_void_lookups {
                    Err(Abort::Perm)
                } else {
                    Ok(None)
                }
            },
        }
    }

    /// Expands the `domain-spec` argument of a directive, or returns the
    /// current domain if there is none.
    fn target_domain(
        &self,
        dns: &mut Cache,
        current: &Rc<DnsName>,
        spec: Option<s::MacroString<'_>>,
    ) -> Result<Rc<DnsName>, Abort> {
        let Some(spec) = spec else {
            return Ok(Rc::clone(current));
        };

        let expanded = self.expand(dns, current, spec, false)?;
        dns.intern_domain(Cow::Borrowed(macros::truncate_domain(&expanded)))
            .map_err(|()| Abort::Perm)
    }

    /// Produces the explanation for a `fail` which came from the record `txt`
    /// at `domain`.
    ///
    /// RFC 7208 § 6.2: any problem at all just means there is no
    /// explanation.
    fn explain(
        &self,
        dns: &mut Cache,
        domain: &DnsName,
        txt: &str,
    ) -> Explanation {
        let Some(spec) = s::Record::parse(txt).ok().and_then(|r| r.explanation)
        else {
            return Explanation::None;
        };

        let target = match self.expand(dns, domain, spec, true) {
            Ok(target) => target,
            Err(Abort::Pending) => return Explanation::NotReady,
            Err(Abort::Temp | Abort::Perm) => return Explanation::None,
        };
        let Ok(target) = dns.intern_domain(Cow::Owned(target)) else {
            return Explanation::None;
        };

        let text = match look_up(&mut dns.txt, &target) {
            Ok(records) => match records.as_slice() {
                [text] => Rc::clone(text),
                _ => return Explanation::None,
            },
            Err(CacheError::NotReady) => return Explanation::NotReady,
            Err(CacheError::NotFound | CacheError::Error) => {
                return Explanation::None;
            },
        };

        match self.expand(dns, domain, s::MacroString::new(&text), true) {
            Ok(explanation) => Explanation::Some(explanation),
            Err(Abort::Pending) => Explanation::NotReady,
            Err(Abort::Temp | Abort::Perm) => Explanation::None,
        }
    }

    /// RFC 7208 § 7
    fn expand(
        &self,
        dns: &mut Cache,
        current: &DnsName,
        spec: s::MacroString<'_>,
        in_exp: bool,
    ) -> Result<String, Abort> {
        let mut out = String::new();
        for element in spec {
            let me = match element.map_err(|_| Abort::Perm)? {
                s::MacroElement::Literal(text) => {
                    out.push_str(text);
                    continue;
                },
                s::MacroElement::Expand(me) => me,
            };

            if me.kind.is_exp_only() && !in_exp {
                return Err(Abort::Perm);
            }

            let value = macros::transform(
                self.macro_value(dns, current, me.kind)?,
                me.keep_parts,
                me.reverse,
                me.delimiters,
            );
            if me.url_encode {
                out.push_str(&macros::url_encode(&value));
            } else {
                out.push_str(&value);
            }
        }

        Ok(out)
    }

    fn macro_value(
        &self,
        dns: &mut Cache,
        current: &DnsName,
        kind: s::Macro,
    ) -> Result<Cow<'e, str>, Abort> {
        use super::syntax::Macro as M;

        let ctx = self.ctx;
        Ok(match kind {
            M::Sender => ctx.sender.as_deref().map_or_else(
                || Cow::Owned(format!("postmaster@{}", ctx.sender_domain)),
                Cow::Borrowed,
            ),
            M::SenderLocalPart => Cow::Borrowed(
                ctx.sender_local.as_deref().unwrap_or("postmaster"),
            ),
            M::SenderDomain => Cow::Borrowed(&*ctx.sender_domain),
            M::Domain => Cow::Owned(name_text(current)),
            M::Ip => Cow::Owned(macros::dotted_ip(ctx.ip)),
            M::Ptr => {
                let name = if self.has_ptr {
                    validated_name(
                        dns,
                        ctx.ip,
                        current,
                        self.config.max_ptr_names,
                    )?
                } else {
                    None
                };
                Cow::Owned(name.map_or_else(
                    || "unknown".to_owned(),
                    |n| name_text(&n),
                ))
            },
            M::IpVersion => Cow::Borrowed(macros::ip_version(ctx.ip)),
            M::HeloDomain => Cow::Borrowed(&*ctx.helo_domain),
            M::SmtpClientIp => Cow::Owned(ctx.ip.to_string()),
            M::ReceivingHost => Cow::Borrowed(&*ctx.receiver_host),
            M::CurrentTimestamp => Cow::Owned(ctx.now.timestamp().to_string()),
        })
    }
}

/// Finds the single SPF record at `domain`, if there is one.
///
/// RFC 7208 § 4.5: more than one is a permanent error.
fn fetch_policy(
    dns: &mut Cache,
    domain: &Rc<DnsName>,
) -> Result<Option<Rc<str>>, Abort> {
    let records = match look_up(&mut dns.txt, domain) {
        Ok(records) => records,
        Err(CacheError::NotFound) => return Ok(None),
        Err(CacheError::Error) => return Err(Abort::Temp),
        Err(CacheError::NotReady) => return Err(Abort::Pending),
    };

    let mut policies = records.iter().filter(|r| s::Record::is_spf(r));
    match (policies.next(), policies.next()) {
        (None, _) => Ok(None),
        (Some(txt), None) => Ok(Some(Rc::clone(txt))),
        (Some(_), Some(_)) => Err(Abort::Perm),
    }
}

/// Formats `name` without the trailing dot of a fully-qualified name.
fn name_text(name: &DnsName) -> String {
    let mut text = name.to_ascii();
    if text.ends_with('.') {
        text.pop();
    }
    text
}

/// Finds a "validated name" of `ip` in or under `target` (RFC 7208 § 5.5).
///
/// An exact match on `target` is preferred over a subdomain. Only the first
/// `max_names` candidates are considered. A candidate validates if its
/// forward lookup includes `ip`; lookup failures just skip the candidate.
fn validated_name(
    dns: &mut Cache,
    ip: IpAddr,
    target: &DnsName,
    max_names: usize,
) -> Result<Option<Rc<DnsName>>, Abort> {
    let candidates: Vec<Rc<DnsName>> = match dns::ptr(&mut dns.ptr, ip) {
        Ok(names) => {
            let (exact, subdomains): (Vec<_>, Vec<_>) = names
                .iter()
                .filter(|n| target.zone_of(n))
                .cloned()
                .partition(|n| **n == *target);
            exact.into_iter().chain(subdomains).take(max_names).collect()
        },
        Err(CacheError::NotReady) => return Err(Abort::Pending),
        // > If a DNS error occurs while doing the PTR RR lookup, then [ptr]
        // > fails to match.
        Err(CacheError::NotFound | CacheError::Error) => return Ok(None),
    };

    // A later candidate only wins once everything before it has been
    // looked up; the rest are still requested in this pass.
    let mut pending = false;
    for name in candidates {
        let found = match ip {
            IpAddr::V4(ip) => {
                look_up(&mut dns.a, &name).map(|addrs| addrs.contains(&ip))
            },
            IpAddr::V6(ip) => {
                look_up(&mut dns.aaaa, &name).map(|addrs| addrs.contains(&ip))
            },
        };

        match found {
            Ok(true) if !pending => return Ok(Some(name)),
            Ok(_) | Err(CacheError::NotFound | CacheError::Error) => {},
            Err(CacheError::NotReady) => pending = true,
        }
    }

    if pending {
        Err(Abort::Pending)
    } else {
        Ok(None)
    }
}
