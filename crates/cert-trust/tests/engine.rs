#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]
#![expect(clippy::clone_on_ref_ptr, reason = "test code clarity over performance")]

mod common;

use std::sync::Arc;

use camino::Utf8PathBuf;
use cert_trust::anchors::StaticAnchors;
use cert_trust::{
    AllowListKey, ConfigStore, IdentityCheck, JsonConfigStore, MemoryConfigStore, PeerSide, Platform, Thumbprint,
    TrustConf, TrustEngine, TrustError, TrustVerdict,
};
use common::{CertSpec, CountingPrompt, MapFetcher, Pki, issued_by, root_ca};
use rustls_pki_types::CertificateDer;

fn engine_with(
    store: Arc<dyn ConfigStore>,
    prompt: Arc<CountingPrompt>,
    anchors: Vec<CertificateDer<'static>>,
) -> TrustEngine {
    TrustEngine::builder(TrustConf::default(), store, prompt)
        .anchors(Arc::new(StaticAnchors(anchors)))
        .fetcher(Arc::new(MapFetcher::new()))
        .platform(Platform::Other)
        .build()
}

fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap()
}

#[test]
fn chain_rooted_in_anchors_is_trusted_without_prompt() {
    let pki = Pki::new(&["server.example"], &[]);
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(Arc::new(MemoryConfigStore::new()), prompt.clone(), vec![pki.root.der()]);

    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap();
    engine
        .check_trusted(
            &pki.full_chain(),
            PeerSide::Server,
            &IdentityCheck::hostnames(["server.example"]),
        )
        .unwrap();

    assert_eq!(prompt.calls(), 0);
}

#[test]
fn client_chain_rooted_in_anchors_is_trusted() {
    let pki = Pki::new(&[], &["alice@example.com"]);
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(Arc::new(MemoryConfigStore::new()), prompt.clone(), vec![pki.root.der()]);

    engine
        .check_trusted(&pki.full_chain(), PeerSide::Client, &IdentityCheck::none())
        .unwrap();

    assert_eq!(prompt.calls(), 0);
}

#[test]
fn always_trust_mode_bypasses_every_check() {
    let pki = Pki::new(&["server.example"], &[]);
    let store = Arc::new(MemoryConfigStore::new());
    store.set_string("cert_trust.always_trust_mode_enabled", "true").unwrap();
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());

    engine
        .check_trusted(&pki.leaf_only(), PeerSide::Server, &IdentityCheck::hostnames(["other.example"]))
        .unwrap();

    assert_eq!(prompt.calls(), 0);
    assert_eq!(store.keys().len(), 1);
}

#[test]
fn declined_certificate_is_not_trusted_and_not_recorded() {
    let pki = Pki::new(&["server.example"], &[]);
    let store = Arc::new(MemoryConfigStore::new());
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());

    let error = engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap_err();

    assert!(error.subject.contains("Test Leaf"));
    assert!(matches!(error.cause, TrustError::DefaultVerification(_)));
    assert_eq!(prompt.calls(), 1);
    assert!(store.keys().is_empty());

    let key = AllowListKey::Server(Thumbprint::of(&pki.leaf.der()));
    assert!(engine.allow_list().session_trusted(&key).is_empty());

    // Declining is not remembered: the next attempt prompts again.
    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap_err();
    assert_eq!(prompt.calls(), 2);
}

#[test]
fn not_trusted_converts_into_a_rustls_certificate_error() {
    let pki = Pki::new(&[], &[]);
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(Arc::new(MemoryConfigStore::new()), prompt, Vec::new());

    let error = engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap_err();

    let error = rustls::Error::from(error);
    assert!(matches!(
        error,
        rustls::Error::InvalidCertificate(rustls::CertificateError::Other(_))
    ));
    assert!(error.to_string().contains("Test Leaf"));
}

#[test]
fn trust_always_survives_a_restart() {
    let pki = Pki::new(&["server.example"], &[]);
    let dir = tempfile::tempdir().unwrap();
    let store_path = utf8_dir(&dir).join("trust.json");

    {
        let store = Arc::new(JsonConfigStore::open(store_path.clone()).unwrap());
        let prompt = CountingPrompt::new(TrustVerdict::TrustAlways);
        let engine = engine_with(store, prompt.clone(), Vec::new());

        engine
            .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
            .unwrap();
        assert_eq!(prompt.calls(), 1);
    }

    let store = Arc::new(JsonConfigStore::open(store_path).unwrap());
    let thumbprint = Thumbprint::of(&pki.leaf.der());
    assert_eq!(
        store.get_string(&format!("cert_trust.server.{thumbprint}")),
        Some(thumbprint.to_string())
    );

    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(store, prompt.clone(), Vec::new());

    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap();
    assert_eq!(prompt.calls(), 0);
}

#[test]
fn session_approval_is_not_persisted() {
    let pki = Pki::new(&["server.example"], &[]);
    let store = Arc::new(MemoryConfigStore::new());
    let prompt = CountingPrompt::new(TrustVerdict::TrustThisSessionOnly);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());

    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap();
    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap();

    assert_eq!(prompt.calls(), 1);
    assert!(store.keys().is_empty());

    // A new engine is a new session.
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(store, prompt.clone(), Vec::new());

    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap_err();
    assert_eq!(prompt.calls(), 1);
}

#[test]
fn hostname_mismatch_on_trusted_chain_prompts() {
    let pki = Pki::new(&["server.example"], &[]);
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(Arc::new(MemoryConfigStore::new()), prompt.clone(), vec![pki.root.der()]);

    let error = engine
        .check_trusted(
            &pki.full_chain(),
            PeerSide::Server,
            &IdentityCheck::hostnames(["evil.example"]),
        )
        .unwrap_err();

    assert!(matches!(error.cause, TrustError::IdentityMismatch(_)));
    assert_eq!(prompt.calls(), 1);
    assert!(prompt.last_reason.lock().as_deref().unwrap().contains("evil.example"));
}

#[test]
fn matching_email_accepts_untrusted_chain() {
    let pki = Pki::new(&[], &["alice@example.com"]);
    let store = Arc::new(MemoryConfigStore::new());
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());

    engine
        .check_trusted(
            &pki.leaf_only(),
            PeerSide::Client,
            &IdentityCheck::emails(["bob@example.com", "alice@example.com"]),
        )
        .unwrap();

    assert_eq!(prompt.calls(), 0);
    assert!(store.keys().is_empty());

    engine
        .check_trusted(&pki.leaf_only(), PeerSide::Client, &IdentityCheck::emails(["bob@example.com"]))
        .unwrap_err();
    assert_eq!(prompt.calls(), 1);
}

#[test]
fn matching_hostname_does_not_rescue_an_untrusted_chain() {
    let leaf = common::self_signed(CertSpec {
        common_name: "bank.example",
        dns_names: &["bank.example"],
        ..Default::default()
    });
    let store = Arc::new(MemoryConfigStore::new());
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());

    let error = engine
        .check_trusted(
            &cert_trust::CertificateChain::from_leaf(leaf.der()),
            PeerSide::Server,
            &IdentityCheck::hostnames(["bank.example"]),
        )
        .unwrap_err();

    assert!(matches!(error.cause, TrustError::DefaultVerification(_)));
    assert_eq!(prompt.calls(), 1);
    assert!(store.keys().is_empty());
}

#[test]
fn matching_hostname_on_untrusted_chain_uses_previous_approval() {
    let pki = Pki::new(&["server.example"], &[]);
    let prompt = CountingPrompt::new(TrustVerdict::TrustAlways);
    let engine = engine_with(Arc::new(MemoryConfigStore::new()), prompt.clone(), Vec::new());
    let identity = IdentityCheck::hostnames(["server.example"]);

    engine.check_trusted(&pki.full_chain(), PeerSide::Server, &identity).unwrap();
    engine.check_trusted(&pki.full_chain(), PeerSide::Server, &identity).unwrap();

    assert_eq!(prompt.calls(), 1);
}

#[test]
fn disabled_prompt_declines_without_asking() {
    let pki = Pki::new(&["server.example"], &[]);
    let store = Arc::new(MemoryConfigStore::new());
    store.set_string("cert_trust.prompt_disabled", "TRUE").unwrap();
    let prompt = CountingPrompt::new(TrustVerdict::TrustAlways);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());

    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
        .unwrap_err();

    assert_eq!(prompt.calls(), 0);
    assert_eq!(store.keys().len(), 1);
}

#[test]
fn approval_is_recorded_under_every_identity() {
    let pki = Pki::new(&["server.example"], &[]);
    let store = Arc::new(MemoryConfigStore::new());
    let prompt = CountingPrompt::new(TrustVerdict::TrustAlways);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());
    let thumbprint = Thumbprint::of(&pki.leaf.der());

    engine
        .check_trusted(
            &pki.full_chain(),
            PeerSide::Server,
            &IdentityCheck::hostnames(["a.example", "b.example"]),
        )
        .unwrap();

    for identity in ["a.example", "b.example"] {
        assert_eq!(
            store.get_string(&format!("cert_trust.param.{identity}")),
            Some(thumbprint.to_string())
        );
    }
    assert!(store.get_string(&format!("cert_trust.server.{thumbprint}")).is_none());

    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::hostnames(["b.example"]))
        .unwrap();
    assert_eq!(prompt.calls(), 1);

    // Approval is scoped to the identity it was given for.
    engine
        .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::hostnames(["c.example"]))
        .unwrap();
    assert_eq!(prompt.calls(), 2);
}

#[test]
fn approvals_accumulate_per_key() {
    let first = Pki::new(&["server.example"], &[]);
    let second = Pki::new(&["server.example"], &[]);
    let store = Arc::new(MemoryConfigStore::new());
    let prompt = CountingPrompt::new(TrustVerdict::TrustAlways);
    let engine = engine_with(store.clone(), prompt.clone(), Vec::new());
    let identity = IdentityCheck::hostnames(["other.example"]);

    engine.check_trusted(&first.full_chain(), PeerSide::Server, &identity).unwrap();
    engine.check_trusted(&second.full_chain(), PeerSide::Server, &identity).unwrap();

    let key = AllowListKey::Identity(String::from("other.example"));
    let trusted = engine.allow_list().always_trusted(&key);

    assert_eq!(trusted.len(), 2);
    assert!(trusted.contains(&Thumbprint::of(&first.leaf.der())));
    assert!(trusted.contains(&Thumbprint::of(&second.leaf.der())));
}

#[test]
fn leaf_only_chain_is_completed_before_verification() {
    let root = root_ca("AIA Root");
    let intermediate = issued_by(
        CertSpec {
            common_name: "AIA Intermediate",
            ca: true,
            ..Default::default()
        },
        &root,
    );
    let leaf = issued_by(
        CertSpec {
            common_name: "AIA Leaf",
            dns_names: &["server.example"],
            ca_issuers: &["http://pki.example/intermediate.crt"],
            ..Default::default()
        },
        &intermediate,
    );

    let fetcher = Arc::new(MapFetcher::new().with("http://pki.example/intermediate.crt", intermediate.der().to_vec()));
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = TrustEngine::builder(TrustConf::default(), Arc::new(MemoryConfigStore::new()), prompt.clone())
        .anchors(Arc::new(StaticAnchors(vec![root.der()])))
        .fetcher(fetcher.clone())
        .platform(Platform::Other)
        .build();

    let chain = cert_trust::CertificateChain::from_leaf(leaf.der());
    let identity = IdentityCheck::hostnames(["server.example"]);

    engine.check_trusted(&chain, PeerSide::Server, &identity).unwrap();
    engine.check_trusted(&chain, PeerSide::Server, &identity).unwrap();

    assert_eq!(prompt.calls(), 0);
    assert_eq!(fetcher.calls("http://pki.example/intermediate.crt"), 1);
}

#[test]
fn unbounded_aia_cache_lifetime_is_accepted() {
    let root = root_ca("AIA Root");
    let intermediate = issued_by(
        CertSpec {
            common_name: "AIA Intermediate",
            ca: true,
            ..Default::default()
        },
        &root,
    );
    let leaf = issued_by(
        CertSpec {
            common_name: "AIA Leaf",
            ca_issuers: &["http://pki.example/intermediate.crt"],
            ..Default::default()
        },
        &intermediate,
    );

    let conf: TrustConf = serde_json::from_str(r#"{ "Aia": { "CacheTtlSecs": 18446744073709551615 } }"#).unwrap();
    let fetcher = Arc::new(MapFetcher::new().with("http://pki.example/intermediate.crt", intermediate.der().to_vec()));
    let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
    let engine = TrustEngine::builder(conf, Arc::new(MemoryConfigStore::new()), prompt.clone())
        .anchors(Arc::new(StaticAnchors(vec![root.der()])))
        .fetcher(fetcher.clone())
        .platform(Platform::Other)
        .build();

    let chain = cert_trust::CertificateChain::from_leaf(leaf.der());

    engine.check_trusted(&chain, PeerSide::Server, &IdentityCheck::none()).unwrap();
    engine.check_trusted(&chain, PeerSide::Server, &IdentityCheck::none()).unwrap();

    assert_eq!(fetcher.total_calls(), 1);
    assert_eq!(prompt.calls(), 0);
}

#[cfg(unix)]
mod remediation {
    use super::*;

    use cert_trust::anchors::PemFileAnchors;

    fn conf(dir: &Utf8PathBuf, script: String) -> TrustConf {
        let mut conf = TrustConf::default();
        conf.state_dir = Some(dir.join("state"));
        conf.remediation.command = vec![
            String::from("sh"),
            String::from("-c"),
            script,
            String::from("probe"),
            String::from("{cert}"),
        ];
        conf.remediation.timeout_ms = 5000;
        conf
    }

    fn leftover_temp_files(dir: &Utf8PathBuf) -> usize {
        std::fs::read_dir(dir.join("state"))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_name().to_string_lossy().starts_with("untrusted-"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn windows_probe_refreshes_the_root_store() {
        let pki = Pki::new(&["server.example"], &[]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = utf8_dir(&tmp);

        let root_pem = dir.join("root.pem");
        std::fs::write(&root_pem, pki.root.pem()).unwrap();
        let anchors_pem = dir.join("anchors.pem");
        std::fs::write(&anchors_pem, "").unwrap();

        // The probe receives the leaf as $1 and installs the root, like the OS lazily would.
        let script = format!("test -s \"$1\" && cat {root_pem} > {anchors_pem}");
        let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
        let engine = TrustEngine::builder(conf(&dir, script), Arc::new(MemoryConfigStore::new()), prompt.clone())
            .anchors(Arc::new(PemFileAnchors::new(anchors_pem)))
            .fetcher(Arc::new(MapFetcher::new()))
            .platform(Platform::Windows)
            .build();

        assert_eq!(engine.verifier().current().anchor_count(), 0);

        engine
            .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
            .unwrap();

        assert_eq!(prompt.calls(), 0);
        assert_eq!(engine.verifier().current().generation(), 1);
        assert_eq!(engine.verifier().current().anchor_count(), 1);
        assert_eq!(leftover_temp_files(&dir), 0);
    }

    #[test]
    fn windows_probe_runs_once_per_check() {
        let pki = Pki::new(&["server.example"], &[]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = utf8_dir(&tmp);
        let counter = dir.join("counter");

        let script = format!("echo run >> {counter}; exit 1");
        let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
        let engine = TrustEngine::builder(conf(&dir, script), Arc::new(MemoryConfigStore::new()), prompt.clone())
            .anchors(Arc::new(StaticAnchors(Vec::new())))
            .fetcher(Arc::new(MapFetcher::new()))
            .platform(Platform::Windows)
            .build();

        engine
            .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
            .unwrap_err();

        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 1);
        assert_eq!(prompt.calls(), 1);
        assert_eq!(leftover_temp_files(&dir), 0);
    }

    #[test]
    fn hanging_probe_is_killed_at_the_deadline() {
        let pki = Pki::new(&["server.example"], &[]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = utf8_dir(&tmp);

        let mut conf = conf(&dir, String::from("exec sleep 30"));
        conf.remediation.timeout_ms = 200;

        let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
        let engine = TrustEngine::builder(conf, Arc::new(MemoryConfigStore::new()), prompt.clone())
            .anchors(Arc::new(StaticAnchors(Vec::new())))
            .fetcher(Arc::new(MapFetcher::new()))
            .platform(Platform::Windows)
            .build();

        let start = std::time::Instant::now();
        engine
            .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
            .unwrap_err();

        assert!(start.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(prompt.calls(), 1);
    }

    #[test]
    fn remediation_leaving_a_background_process_does_not_stall_the_check() {
        let pki = Pki::new(&["server.example"], &[]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = utf8_dir(&tmp);

        let mut conf = conf(&dir, String::from("sleep 5 & exit 0"));
        conf.remediation.timeout_ms = 200;

        let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
        let engine = TrustEngine::builder(conf, Arc::new(MemoryConfigStore::new()), prompt.clone())
            .anchors(Arc::new(StaticAnchors(Vec::new())))
            .fetcher(Arc::new(MapFetcher::new()))
            .platform(Platform::Windows)
            .build();

        let start = std::time::Instant::now();
        engine
            .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
            .unwrap_err();

        assert!(start.elapsed() < std::time::Duration::from_secs(3));
        assert_eq!(prompt.calls(), 1);
    }

    #[test]
    fn unbounded_remediation_timeout_is_accepted() {
        let pki = Pki::new(&["server.example"], &[]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = utf8_dir(&tmp);

        let mut conf = conf(&dir, String::from("exit 1"));
        conf.remediation.timeout_ms = u64::MAX;

        let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
        let engine = TrustEngine::builder(conf, Arc::new(MemoryConfigStore::new()), prompt.clone())
            .anchors(Arc::new(StaticAnchors(Vec::new())))
            .fetcher(Arc::new(MapFetcher::new()))
            .platform(Platform::Windows)
            .build();

        engine
            .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
            .unwrap_err();

        assert_eq!(prompt.calls(), 1);
        assert_eq!(leftover_temp_files(&dir), 0);
    }

    #[test]
    fn no_probe_outside_windows() {
        let pki = Pki::new(&["server.example"], &[]);
        let tmp = tempfile::tempdir().unwrap();
        let dir = utf8_dir(&tmp);
        let counter = dir.join("counter");

        let script = format!("echo run >> {counter}");
        let prompt = CountingPrompt::new(TrustVerdict::DoNotTrust);
        let engine = TrustEngine::builder(conf(&dir, script), Arc::new(MemoryConfigStore::new()), prompt.clone())
            .anchors(Arc::new(StaticAnchors(Vec::new())))
            .fetcher(Arc::new(MapFetcher::new()))
            .platform(Platform::Other)
            .build();

        engine
            .check_trusted(&pki.full_chain(), PeerSide::Server, &IdentityCheck::none())
            .unwrap_err();

        assert!(!counter.exists());
        assert_eq!(engine.verifier().current().generation(), 0);
    }
}
