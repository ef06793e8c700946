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
use std::net::IpAddr;

use chrono::prelude::*;
use log::{debug, info, warn};

use super::eval::{eval, Context, Evaluation, Explanation, SpfResult};
use crate::support::dns::{self, Cache, Resolver};
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SpfConfig;

/// The client-side facts an SPF check is made about.
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// The address of the SMTP client.
    pub ip: IpAddr,
    /// The `MAIL FROM` address, if there was a non-null one.
    pub sender: Option<String>,
    /// The `HELO`/`EHLO` domain. Defaults to the domain being checked.
    pub helo: Option<String>,
}

/// The final outcome of `spf_verify`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub result: SpfResult,
    /// The text of the directive which decided `result`, if any.
    pub mechanism: Option<String>,
    /// The explanation published by the domain for a `fail` result.
    pub explanation: Option<String>,
}

/// Runs SPF evaluation against the given context until a conclusion is
/// reached or `deadline` passes.
///
/// `dns_cache` is populated as the function runs. Each pass of the evaluator
/// that stops for want of DNS records is followed by resolving everything it
/// asked for through `resolver`.
///
/// If the deadline passes before there is a result, the result is
/// `TempError`. If there is a result but the explanation is still pending, the
/// result stands without an explanation.
pub async fn run(
    ctx: &Context<'_>,
    dns_cache: &mut Cache,
    resolver: &impl Resolver,
    config: &SpfConfig,
    deadline: tokio::time::Instant,
) -> Evaluation {
    let mut result = None::<Evaluation>;

    loop {
        if let Some(r) = eval(ctx, dns_cache, config) {
            let explanation_pending =
                matches!(r.explanation, Explanation::NotReady);
            result = Some(r);
            // If we have our result, but the explanation is still pending,
            // keep going until we get our explanation or the deadline
            // expires.
            if !explanation_pending {
                break;
            }
        }

        match tokio::time::timeout_at(
            deadline,
            dns::resolve_new(dns_cache, resolver),
        )
        .await
        {
            Ok(0) => break,
            Ok(_) => {},
            Err(_) => {
                warn!("SPF evaluation for {} timed out", ctx.spf_domain);
                break;
            },
        }
    }

    match result {
        Some(mut r) => {
            if matches!(r.explanation, Explanation::NotReady) {
                r.explanation = Explanation::None;
            }
            r
        },

        None => Evaluation {
            result: SpfResult::TempError,
            mechanism: None,
            explanation: Explanation::None,
        },
    }
}

/// Checks whether `options.ip` is authorised to send mail for `domain`.
///
/// This is `check_host()` from RFC 7208 § 4, with DNS queries going through
/// `resolver` and the limits and deadline taken from `config`.
pub async fn spf_verify(
    domain: &str,
    options: &VerifyOptions,
    resolver: &impl Resolver,
    config: &SpfConfig,
) -> Verdict {
    let ip = options.ip.to_canonical();
    let mut log_prefix = LogPrefix::new("spf").with_ip(ip).with_domain(domain);
    if let Some(ref sender) = options.sender {
        log_prefix = log_prefix.with_sender(sender);
    }

    let domain = domain.strip_suffix('.').unwrap_or(domain);
    let mut dns_cache = Cache::default();

    // RFC 7208 § 4.3: a malformed or single-label domain is "none" without
    // any queries.
    let spf_domain = match dns_cache.intern_domain(Cow::Borrowed(domain)) {
        Ok(name) if domain.contains('.') => name,
        _ => {
            info!("{} invalid domain, result none", log_prefix);
            return Verdict {
                result: SpfResult::None,
                mechanism: None,
                explanation: None,
            };
        },
    };

    let helo = options.helo.as_deref().unwrap_or(domain);
    // An empty local part is treated as "postmaster" (§ 4.3), which is what
    // the evaluator does for an absent sender.
    let (sender, sender_local, sender_domain) = match options
        .sender
        .as_deref()
        .and_then(|s| s.rsplit_once('@').map(|(l, d)| (s, l, d)))
    {
        Some((_, "", d)) if !d.is_empty() => (None, None, d),
        Some((s, l, d)) if !d.is_empty() => {
            (Some(Cow::Borrowed(s)), Some(Cow::Borrowed(l)), d)
        },
        _ => (None, None, helo),
    };

    let ctx = Context {
        sender,
        sender_local,
        sender_domain: Cow::Borrowed(sender_domain),
        spf_domain,
        helo_domain: Cow::Borrowed(helo),
        ip,
        receiver_host: Cow::Borrowed(config.receiver_host.as_str()),
        now: Utc::now(),
    };

    debug!("{} starting evaluation", log_prefix);
    let deadline = tokio::time::Instant::now() + config.timeout();
    let evaluation =
        run(&ctx, &mut dns_cache, resolver, config, deadline).await;

    info!(
        "{} result {} ({})",
        log_prefix,
        evaluation.result,
        evaluation.mechanism.as_deref().unwrap_or("default"),
    );

    Verdict {
        result: evaluation.result,
        mechanism: evaluation.mechanism,
        explanation: match evaluation.explanation {
            Explanation::Some(s) => Some(s),
            Explanation::None | Explanation::NotReady => None,
        },
    }
}

#[cfg(test)]
mod test {
    use std::future::Future;

    use super::*;
    use crate::support::dns::{
        FnResolver, MxRecord, Records, RecordType, ResolveError,
    };

    fn record_type(records: &Records) -> RecordType {
        match *records {
            Records::Txt(_) => RecordType::Txt,
            Records::A(_) => RecordType::A,
            Records::Aaaa(_) => RecordType::Aaaa,
            Records::Mx(_) => RecordType::Mx,
            Records::Ptr(_) => RecordType::Ptr,
        }
    }

    fn txt(s: &str) -> Records {
        Records::Txt(vec![vec![s.to_owned()]])
    }

    fn a(addrs: &[&str]) -> Records {
        Records::A(addrs.iter().map(|a| a.parse().unwrap()).collect())
    }

    fn aaaa(addrs: &[&str]) -> Records {
        Records::Aaaa(addrs.iter().map(|a| a.parse().unwrap()).collect())
    }

    fn ptr(names: &[&str]) -> Records {
        Records::Ptr(names.iter().map(|&n| n.to_owned()).collect())
    }

    /// A resolver which answers from a fixed list of records. Anything not
    /// in the list has no records.
    fn zone(
        records: Vec<(&'static str, Records)>,
    ) -> FnResolver<impl Fn(&str, RecordType) -> Result<Records, ResolveError>>
    {
        FnResolver(move |name: &str, rt: RecordType| {
            let mut answers = records
                .iter()
                .filter(|r| r.0.eq_ignore_ascii_case(name))
                .filter(|r| record_type(&r.1) == rt)
                .map(|r| r.1.clone());
            Ok(answers.next().unwrap_or_else(|| Records::empty(rt)))
        })
    }

    fn options(ip: &str) -> VerifyOptions {
        VerifyOptions {
            ip: ip.parse().unwrap(),
            sender: None,
            helo: None,
        }
    }

    async fn verify(resolver: &impl Resolver, ip: &str) -> Verdict {
        spf_verify(
            "example.com",
            &options(ip),
            resolver,
            &SpfConfig::default(),
        )
        .await
    }

    #[tokio::test]
    async fn all_qualifiers() {
        crate::init_test_log();

        let resolver = zone(vec![("example.com", txt("v=spf1 +all"))]);
        let verdict = verify(&resolver, "192.0.2.1").await;
        assert_eq!(SpfResult::Pass, verdict.result);
        assert_eq!(Some('+'), verdict.result.qualifier());
        assert_eq!(Some("+all"), verdict.mechanism.as_deref());

        let resolver = zone(vec![("example.com", txt("v=spf1 -all"))]);
        let verdict = verify(&resolver, "192.0.2.1").await;
        assert_eq!(SpfResult::Fail, verdict.result);
        assert_eq!(Some('-'), verdict.result.qualifier());
    }

    #[tokio::test]
    async fn a_mechanism() {
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 a -all")),
            ("example.com", a(&["192.0.2.10", "192.0.2.11"])),
        ]);

        let verdict = verify(&resolver, "192.0.2.10").await;
        assert_eq!(SpfResult::Pass, verdict.result);
        assert_eq!(Some("a"), verdict.mechanism.as_deref());
        assert_eq!(
            SpfResult::Pass,
            verify(&resolver, "192.0.2.11").await.result,
        );

        let verdict = verify(&resolver, "1.2.3.4").await;
        assert_eq!(SpfResult::Fail, verdict.result);
        assert_eq!(Some("-all"), verdict.mechanism.as_deref());
    }

    #[tokio::test]
    async fn mx_mechanism() {
        for (record, ip, expected) in [
            ("v=spf1 mx -all", "192.0.2.10", SpfResult::Pass),
            ("v=spf1 mx -all", "192.0.2.56", SpfResult::Fail),
            ("v=spf1 mx/24 -all", "192.0.2.56", SpfResult::Pass),
            ("v=spf1 mx/24 -all", "1.2.3.4", SpfResult::Fail),
            ("v=spf1 mx/24//64 -all", "192.0.2.56", SpfResult::Pass),
            ("v=spf1 mx/24//64 -all", "2001:db8::ffff", SpfResult::Pass),
            ("v=spf1 mx/24//64 -all", "2001:db8:1::1", SpfResult::Fail),
            ("v=spf1 mx//64 -all", "192.0.2.56", SpfResult::Fail),
        ] {
            // Every name has the same addresses.
            let resolver = FnResolver(move |name: &str, rt: RecordType| {
                Ok(match rt {
                    RecordType::Txt if "example.com" == name => txt(record),
                    RecordType::Mx if "example.com" == name => {
                        Records::Mx(vec![MxRecord {
                            priority: 10,
                            exchange: "example.com".to_owned(),
                        }])
                    },
                    RecordType::A => a(&["192.0.2.10", "192.0.2.11"]),
                    RecordType::Aaaa => aaaa(&["2001:db8::10"]),
                    rt => Records::empty(rt),
                })
            });

            assert_eq!(
                expected,
                verify(&resolver, ip).await.result,
                "{record} for {ip}",
            );
        }
    }

    #[tokio::test]
    async fn exists_with_sender_macros() {
        let resolver = zone(vec![
            (
                "example.com",
                txt("v=spf1 exists:%{ir}.%{l1r+-}._spf.%{d} -all"),
            ),
            ("4.3.2.1.some._spf.example.com", a(&["127.0.0.1"])),
        ]);

        for (ip, expected) in
            [("1.2.3.4", SpfResult::Pass), ("1.2.2.4", SpfResult::Fail)]
        {
            let verdict = spf_verify(
                "example.com",
                &VerifyOptions {
                    ip: ip.parse().unwrap(),
                    sender: Some("some+user@example.com".to_owned()),
                    helo: Some("mail.example.net".to_owned()),
                },
                &resolver,
                &SpfConfig::default(),
            )
            .await;
            assert_eq!(expected, verdict.result, "{ip}");
        }
    }

    #[tokio::test]
    async fn empty_local_part_is_postmaster() {
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 exists:%{l}.%{o}.list -all")),
            ("postmaster.sender.test.list", a(&["127.0.0.1"])),
        ]);

        let verdict = spf_verify(
            "example.com",
            &VerifyOptions {
                ip: "192.0.2.1".parse().unwrap(),
                sender: Some("@sender.test".to_owned()),
                helo: None,
            },
            &resolver,
            &SpfConfig::default(),
        )
        .await;
        assert_eq!(SpfResult::Pass, verdict.result);
    }

    #[tokio::test]
    async fn ipv4_mapped_client() {
        let resolver =
            zone(vec![("example.com", txt("v=spf1 ip4:192.0.2.0/24 -all"))]);
        assert_eq!(
            SpfResult::Pass,
            verify(&resolver, "::ffff:192.0.2.10").await.result,
        );
    }

    #[tokio::test]
    async fn no_policy() {
        let resolver = zone(vec![("example.com", txt("some other record"))]);
        let verdict = verify(&resolver, "192.0.2.1").await;
        assert_eq!(SpfResult::None, verdict.result);
        assert_eq!(None, verdict.result.qualifier());

        let resolver = zone(vec![]);
        assert_eq!(
            SpfResult::None,
            verify(&resolver, "192.0.2.1").await.result,
        );
    }

    #[tokio::test]
    async fn invalid_domain_makes_no_queries() {
        let resolver = FnResolver(
            |name: &str, _: RecordType| -> Result<Records, ResolveError> {
                panic!("unexpected lookup of {name}")
            },
        );

        for domain in ["localhost", ""] {
            let verdict = spf_verify(
                domain,
                &options("192.0.2.1"),
                &resolver,
                &SpfConfig::default(),
            )
            .await;
            assert_eq!(SpfResult::None, verdict.result, "{domain:?}");
        }
    }

    #[tokio::test]
    async fn permanent_errors() {
        for record in [
            "v=spf1 include:example.com",
            "v=spf1 redirect=example.com",
            "v=spf1 ip4:192.0.2.1 ip4:bogus -all",
            "v=spf1 a:a.example.com a:b.example.com a:c.example.com -all",
        ] {
            let resolver = zone(vec![("example.com", txt(record))]);
            let verdict = verify(&resolver, "192.0.2.1").await;
            assert_eq!(SpfResult::PermError, verdict.result, "{record}");
            assert_eq!(None, verdict.mechanism);
        }

        let resolver = FnResolver(|_: &str, rt: RecordType| {
            Ok(match rt {
                RecordType::Txt => Records::Txt(vec![
                    vec!["v=spf1 +all".to_owned()],
                    vec!["v=spf1 -all".to_owned()],
                ]),
                rt => Records::empty(rt),
            })
        });
        assert_eq!(
            SpfResult::PermError,
            verify(&resolver, "192.0.2.1").await.result,
        );
    }

    #[tokio::test]
    async fn resolver_failures_are_temporary() {
        let resolver = FnResolver(|_: &str, _: RecordType| {
            Err(ResolveError::ServerFailure)
        });
        assert_eq!(
            SpfResult::TempError,
            verify(&resolver, "192.0.2.1").await.result,
        );

        let resolver = FnResolver(|_: &str, rt: RecordType| match rt {
            RecordType::Txt => Ok(txt("v=spf1 a ip4:192.0.2.1 -all")),
            _ => Err(ResolveError::Timeout),
        });
        // The error is not skipped over, even though a later mechanism would
        // have matched.
        let verdict = verify(&resolver, "192.0.2.1").await;
        assert_eq!(SpfResult::TempError, verdict.result);
        assert_eq!(None, verdict.result.qualifier());
    }

    struct StalledResolver;

    impl Resolver for StalledResolver {
        fn lookup(
            &self,
            _: &str,
            _: RecordType,
        ) -> impl Future<Output = Result<Records, ResolveError>> {
            std::future::pending()
        }
    }

    #[tokio::test]
    async fn deadline_is_temporary_error() {
        let config = SpfConfig {
            timeout_secs: 0,
            ..SpfConfig::default()
        };
        let verdict = spf_verify(
            "example.com",
            &options("192.0.2.1"),
            &StalledResolver,
            &config,
        )
        .await;
        assert_eq!(SpfResult::TempError, verdict.result);
    }

    #[tokio::test]
    async fn explanation() {
        let resolver = zone(vec![
            (
                "example.com",
                txt("v=spf1 ip4:192.0.2.0/24 -all exp=explain.%{d}"),
            ),
            (
                "explain.example.com",
                txt("%{i} is not one of %{d}'s designated mail servers."),
            ),
        ]);

        let verdict = verify(&resolver, "1.2.3.4").await;
        assert_eq!(SpfResult::Fail, verdict.result);
        assert_eq!(
            Some(
                "1.2.3.4 is not one of example.com's designated mail servers."
            ),
            verdict.explanation.as_deref(),
        );

        let verdict = verify(&resolver, "192.0.2.1").await;
        assert_eq!(SpfResult::Pass, verdict.result);
        assert_eq!(None, verdict.explanation);
    }

    #[tokio::test]
    async fn receiver_host_and_client_ip_in_explanation() {
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 -all exp=why.example.com")),
            ("why.example.com", txt("%{r} rejected %{c}")),
        ]);
        let config = SpfConfig {
            receiver_host: "mx.receiver.test".to_owned(),
            ..SpfConfig::default()
        };

        let verdict = spf_verify(
            "example.com",
            &options("2001:db8::1"),
            &resolver,
            &config,
        )
        .await;
        assert_eq!(
            Some("mx.receiver.test rejected 2001:db8::1"),
            verdict.explanation.as_deref(),
        );
    }

    #[tokio::test]
    async fn include_resolves_across_passes() {
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 include:_spf.example.net ~all")),
            ("_spf.example.net", txt("v=spf1 a:mail.example.net")),
            ("mail.example.net", a(&["192.0.2.25"])),
        ]);

        let verdict = verify(&resolver, "192.0.2.25").await;
        assert_eq!(SpfResult::Pass, verdict.result);
        assert_eq!(
            Some("include:_spf.example.net"),
            verdict.mechanism.as_deref(),
        );

        let verdict = verify(&resolver, "192.0.2.26").await;
        assert_eq!(SpfResult::SoftFail, verdict.result);
        assert_eq!(Some("~all"), verdict.mechanism.as_deref());
    }

    #[tokio::test]
    async fn dual_cidr_lengths() {
        for (record, ip, expected) in [
            ("v=spf1 a/24//64 -all", "192.0.2.56", "a/24//64"),
            ("v=spf1 a/24//64 -all", "2001:db8::ff", "a/24//64"),
            ("v=spf1 a/24//64 -all", "2001:db8:1::10", "-all"),
            (
                "v=spf1 a//64 ip4:192.0.2.0/24 -all",
                "192.0.2.56",
                "ip4:192.0.2.0/24",
            ),
            ("v=spf1 a//64 -all", "2001:db8::ff", "a//64"),
            ("v=spf1 a:example.com/30 -all", "192.0.2.11", "a:example.com/30"),
            ("v=spf1 a:example.com/30 -all", "192.0.2.12", "-all"),
        ] {
            let resolver = zone(vec![
                ("example.com", txt(record)),
                ("example.com", a(&["192.0.2.10"])),
                ("example.com", aaaa(&["2001:db8::10"])),
            ]);
            let verdict = verify(&resolver, ip).await;
            assert_eq!(
                Some(expected),
                verdict.mechanism.as_deref(),
                "{record} for {ip}",
            );
        }

        // A single slash always introduces the IPv4 length, and 64 is too
        // long for that.
        let resolver = zone(vec![("example.com", txt("v=spf1 a/24/64 -all"))]);
        assert_eq!(
            SpfResult::PermError,
            verify(&resolver, "192.0.2.1").await.result,
        );
    }

    #[tokio::test]
    async fn address_ranges() {
        let resolver = zone(vec![(
            "example.com",
            txt("v=spf1 ip4:192.0.2.1 ?ip4:198.51.100.0/23 \
                 ip6:2001:db8::1 ~ip6:2001:db8:cafe::/48 -all"),
        )]);

        for (ip, expected) in [
            ("192.0.2.1", SpfResult::Pass),
            ("192.0.2.2", SpfResult::Fail),
            ("198.51.101.200", SpfResult::Neutral),
            ("198.51.102.1", SpfResult::Fail),
            ("2001:db8::1", SpfResult::Pass),
            ("2001:db8::2", SpfResult::Fail),
            ("2001:db8:cafe:ffff::1", SpfResult::SoftFail),
            ("2001:db8:caff::1", SpfResult::Fail),
        ] {
            assert_eq!(expected, verify(&resolver, ip).await.result, "{ip}");
        }
    }

    #[tokio::test]
    async fn ptr_mechanism() {
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 ptr -all")),
            ("10.2.0.192.in-addr.arpa", ptr(&["mail.example.com"])),
            ("11.2.0.192.in-addr.arpa", ptr(&["mail.example.com"])),
            ("12.2.0.192.in-addr.arpa", ptr(&["mail.example.net"])),
            ("mail.example.com", a(&["192.0.2.10"])),
            ("mail.example.net", a(&["192.0.2.12"])),
        ]);

        // 192.0.2.11 claims a name which doesn't resolve back to it, and
        // 192.0.2.12 has a name outside the domain.
        for (ip, expected) in [
            ("192.0.2.10", SpfResult::Pass),
            ("192.0.2.11", SpfResult::Fail),
            ("192.0.2.12", SpfResult::Fail),
            ("192.0.2.13", SpfResult::Fail),
        ] {
            assert_eq!(expected, verify(&resolver, ip).await.result, "{ip}");
        }
    }

    #[tokio::test]
    async fn void_lookup_limit() {
        let resolver = zone(vec![(
            "example.com",
            txt("v=spf1 a:v1.example.com mx:v2.example.com \
                 exists:v3.example.com ip4:192.0.2.1 -all"),
        )]);

        // The third empty answer is one too many.
        assert_eq!(
            SpfResult::PermError,
            verify(&resolver, "192.0.2.1").await.result,
        );

        let config = SpfConfig {
            max_void_lookups: 3,
            ..SpfConfig::default()
        };
        let verdict =
            spf_verify("example.com", &options("192.0.2.1"), &resolver, &config)
                .await;
        assert_eq!(SpfResult::Pass, verdict.result);
    }

    #[tokio::test]
    async fn dns_directive_limit() {
        for (record, expected) in [
            ("v=spf1 a a a a a a a a a a -all", SpfResult::Fail),
            ("v=spf1 a a a a a a a a a a a -all", SpfResult::PermError),
            // ip4 and all don't query DNS
            (
                "v=spf1 a a a a a a a a a a ip4:192.0.2.1 -all",
                SpfResult::Pass,
            ),
            // ... but redirect does
            (
                "v=spf1 a a a a a a a a a a redirect=other.example.com",
                SpfResult::PermError,
            ),
        ] {
            let resolver = zone(vec![
                ("example.com", txt(record)),
                ("example.com", a(&["198.51.100.1"])),
                ("other.example.com", txt("v=spf1 -all")),
            ]);
            assert_eq!(
                expected,
                verify(&resolver, "192.0.2.1").await.result,
                "{record}",
            );
        }
    }

    #[tokio::test]
    async fn include_outcomes() {
        for (inner, expected) in [
            ("v=spf1 ip4:192.0.2.1", SpfResult::Pass),
            ("v=spf1 ?ip4:192.0.2.1", SpfResult::Fail),
            ("v=spf1 -ip4:192.0.2.1", SpfResult::Fail),
            ("v=spf1 ~all", SpfResult::Fail),
            ("v=spf1 ip4:192.0.2.1 bogus", SpfResult::PermError),
            ("not a policy", SpfResult::PermError),
        ] {
            let resolver = zone(vec![
                ("example.com", txt("v=spf1 include:inc.example.net -all")),
                ("inc.example.net", txt(inner)),
            ]);
            assert_eq!(
                expected,
                verify(&resolver, "192.0.2.1").await.result,
                "{inner}",
            );
        }

        let resolver = FnResolver(|name: &str, rt: RecordType| match name {
            "example.com" => Ok(txt("v=spf1 include:inc.example.net -all")),
            _ if RecordType::Txt == rt => Err(ResolveError::ServerFailure),
            _ => Ok(Records::empty(rt)),
        });
        assert_eq!(
            SpfResult::TempError,
            verify(&resolver, "192.0.2.1").await.result,
        );

        // %{d} in the included record is the included domain
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 include:inc.example.net -all")),
            ("inc.example.net", txt("v=spf1 exists:%{d}.list.test")),
            ("inc.example.net.list.test", a(&["127.0.0.2"])),
        ]);
        assert_eq!(
            SpfResult::Pass,
            verify(&resolver, "192.0.2.1").await.result,
        );
    }

    #[tokio::test]
    async fn recursion_is_bounded() {
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 include:loop.example.com")),
            ("loop.example.com", txt("v=spf1 include:example.com")),
        ]);
        assert_eq!(
            SpfResult::PermError,
            verify(&resolver, "192.0.2.1").await.result,
        );

        let config = SpfConfig {
            max_dns_directives: 1000,
            max_depth: 3,
            ..SpfConfig::default()
        };
        let verdict =
            spf_verify("example.com", &options("192.0.2.1"), &resolver, &config)
                .await;
        assert_eq!(SpfResult::PermError, verdict.result);
    }

    #[tokio::test]
    async fn redirect() {
        let other = ("other.example.net", txt("v=spf1 ip4:192.0.2.0/24 -all"));

        // Every directive comes before the redirect, wherever it is written.
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 redirect=other.example.net -all")),
            other.clone(),
        ]);
        let verdict = verify(&resolver, "192.0.2.1").await;
        assert_eq!(SpfResult::Fail, verdict.result);
        assert_eq!(Some("-all"), verdict.mechanism.as_deref());

        let resolver = zone(vec![
            (
                "example.com",
                txt("v=spf1 ip4:198.51.100.1 redirect=other.example.net"),
            ),
            other,
        ]);
        let verdict = verify(&resolver, "192.0.2.1").await;
        assert_eq!(SpfResult::Pass, verdict.result);
        assert_eq!(Some("ip4:192.0.2.0/24"), verdict.mechanism.as_deref());
        let verdict = verify(&resolver, "198.51.100.1").await;
        assert_eq!(Some("ip4:198.51.100.1"), verdict.mechanism.as_deref());

        // A redirect to a domain with no policy is an error, not "none"
        let resolver = zone(vec![(
            "example.com",
            txt("v=spf1 redirect=nothing.example.net"),
        )]);
        assert_eq!(
            SpfResult::PermError,
            verify(&resolver, "192.0.2.1").await.result,
        );
    }

    #[tokio::test]
    async fn explanation_sources() {
        // The explanation comes from the record which failed.
        let resolver = zone(vec![
            (
                "example.com",
                txt("v=spf1 -ip4:192.0.2.66 exp=why.example.com \
                     redirect=other.example.net"),
            ),
            ("why.example.com", txt("banned")),
            (
                "other.example.net",
                txt("v=spf1 ip4:192.0.2.0/24 -all exp=why.other.example.net"),
            ),
            ("why.other.example.net", txt("%{d} only allows 192.0.2.0/24")),
        ]);
        for (ip, explanation) in [
            ("192.0.2.66", Some("banned")),
            (
                "198.51.100.1",
                Some("other.example.net only allows 192.0.2.0/24"),
            ),
            ("192.0.2.1", None),
        ] {
            assert_eq!(
                explanation,
                verify(&resolver, ip).await.explanation.as_deref(),
                "{ip}",
            );
        }

        // Anything unusual about the explanation record means there is none,
        // without affecting the result.
        for exp in [
            Records::Txt(vec![vec!["one".to_owned()], vec!["two".to_owned()]]),
            Records::Txt(vec![]),
            txt("unterminated %{d"),
        ] {
            let resolver = zone(vec![
                ("example.com", txt("v=spf1 -all exp=why.example.com")),
                ("why.example.com", exp.clone()),
            ]);
            let verdict = verify(&resolver, "192.0.2.1").await;
            assert_eq!(SpfResult::Fail, verdict.result, "{exp:?}");
            assert_eq!(None, verdict.explanation, "{exp:?}");
        }
    }

    #[tokio::test]
    async fn macro_expansion_examples() {
        // RFC 7208 § 7.4, expanded into the name queried by exists.
        for (ip, domain_spec, expected) in [
            ("192.0.2.3", "%{o}", "email.example.com"),
            ("192.0.2.3", "%{d2}", "example.com"),
            ("192.0.2.3", "%{dr}", "com.example.email"),
            ("192.0.2.3", "%{l-}", "strong.bad"),
            ("192.0.2.3", "%{l1r-}", "strong"),
            (
                "192.0.2.3",
                "%{ir}.%{v}._spf.%{d2}",
                "3.2.0.192.in-addr._spf.example.com",
            ),
            (
                "192.0.2.3",
                "%{lr-}.lp._spf.%{d2}",
                "bad.strong.lp._spf.example.com",
            ),
            (
                "192.0.2.3",
                "%{ir}.%{v}.%{l1r-}.lp._spf.%{d2}",
                "3.2.0.192.in-addr.strong.lp._spf.example.com",
            ),
            (
                "192.0.2.3",
                "%{d2}.trusted-domains.example.net",
                "example.com.trusted-domains.example.net",
            ),
            (
                "2001:db8::cb01",
                "%{ir}.%{v}._spf.%{d2}",
                "1.0.b.c.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2\
                 .ip6._spf.example.com",
            ),
        ] {
            let record = format!("v=spf1 exists:{domain_spec} -all");
            let resolver = FnResolver(move |name: &str, rt: RecordType| {
                Ok(match (name, rt) {
                    ("email.example.com", RecordType::Txt) => txt(&record),
                    (name, RecordType::A) if name == expected => {
                        a(&["127.0.0.2"])
                    },
                    (_, rt) => Records::empty(rt),
                })
            });

            let verdict = spf_verify(
                "email.example.com",
                &VerifyOptions {
                    ip: ip.parse().unwrap(),
                    sender: Some("strong-bad@email.example.com".to_owned()),
                    helo: None,
                },
                &resolver,
                &SpfConfig::default(),
            )
            .await;
            assert_eq!(SpfResult::Pass, verdict.result, "{domain_spec}");
        }
    }

    #[tokio::test]
    async fn null_sender_uses_helo() {
        let resolver = zone(vec![
            ("example.com", txt("v=spf1 exists:%{l}.%{o}.%{h}.list -all")),
            (
                "postmaster.mail.example.net.mail.example.net.list",
                a(&["127.0.0.2"]),
            ),
        ]);
        let verdict = spf_verify(
            "example.com",
            &VerifyOptions {
                ip: "192.0.2.1".parse().unwrap(),
                sender: None,
                helo: Some("mail.example.net".to_owned()),
            },
            &resolver,
            &SpfConfig::default(),
        )
        .await;
        assert_eq!(SpfResult::Pass, verdict.result);
    }
}

#[cfg(all(test, feature = "live-network-tests"))]
mod live_test {
    use super::*;
    use crate::support::dns::HickoryResolver;

    #[tokio::main(flavor = "current_thread")]
    async fn run_test(domain: &str, ip: &str) -> (SpfResult, Option<String>) {
        let resolver = HickoryResolver::from_system_conf().unwrap();
        let verdict = spf_verify(
            domain,
            &VerifyOptions {
                ip: ip.parse().unwrap(),
                sender: None,
                helo: None,
            },
            &resolver,
            &SpfConfig::default(),
        )
        .await;
        (verdict.result, verdict.explanation)
    }

    #[test]
    fn simple() {
        assert_eq!(
            (SpfResult::Pass, None),
            run_test("simple.spftest.lin.gl", "192.0.2.1"),
        );
        assert_eq!(
            (SpfResult::Neutral, None),
            run_test("simple.spftest.lin.gl", "192.0.2.2"),
        );
    }

    #[test]
    fn amx() {
        assert_eq!(
            (SpfResult::Pass, None),
            run_test("amx.spftest.lin.gl", "192.0.2.1"),
        );
        assert_eq!(
            (SpfResult::Pass, None),
            run_test("amx.spftest.lin.gl", "2001:db8::2"),
        );
        assert_eq!(
            (
                SpfResult::Fail,
                Some("192.0.2.3 is not allowed!".to_owned()),
            ),
            run_test("amx.spftest.lin.gl", "192.0.2.3"),
        );
    }
}
