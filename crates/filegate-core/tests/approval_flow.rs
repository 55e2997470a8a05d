//! End-to-end workflow tests over a real temporary filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use filegate_core::archive::ArchiveKind;
use filegate_core::config::EngineConfig;
use filegate_core::deadline::Deadline;
use filegate_core::engine::ApprovalEngine;
use filegate_core::identity::{MemoryIdentityProvider, Role};
use filegate_core::listing::ListFilter;
use filegate_core::notify::NotificationKind;
use filegate_core::submission::{PlacementOutcome, SubmissionState};

struct Harness {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    engine: Arc<ApprovalEngine>,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let mut config = EngineConfig {
        network_root: root.join("share"),
        local_fallback_root: root.join("local"),
        project_root: Some(root.join("projects")),
        ..EngineConfig::default()
    };
    tweak(&mut config);

    let identity = MemoryIdentityProvider::new()
        .with_user("alice", Role::User, &["AGCC"])
        .with_user("dave", Role::User, &["AGCC"])
        .with_user("erin", Role::User, &["KUSAKABE"])
        .with_user("tl_bob", Role::TeamLeader, &["AGCC"])
        .with_user("tl_carol", Role::TeamLeader, &["KUSAKABE"])
        .with_user("admin", Role::Admin, &[]);

    Harness {
        _tmp: tmp,
        root,
        engine: Arc::new(ApprovalEngine::new(config, Arc::new(identity))),
    }
}

impl Harness {
    fn upload(&self, user: &str, filename: &str) -> PathBuf {
        let dir = self.root.join("share/uploads").join(user);
        std::fs::create_dir_all(&dir).expect("mkdir uploads");
        let path = dir.join(filename);
        std::fs::write(&path, b"artifact-bytes").expect("write upload");
        path
    }

    fn submit(&self, user: &str, filename: &str) -> String {
        let upload = self.upload(user, filename);
        self.engine
            .submit(user, &upload, "test artifact", vec![], Deadline::none())
            .expect("submit accepted")
            .submission
            .id
    }

    fn inbox_kinds(&self, user: &str) -> Vec<NotificationKind> {
        self.engine
            .get_inbox(user, false)
            .expect("inbox")
            .into_iter()
            .map(|n| n.kind)
            .collect()
    }
}

#[test]
fn happy_path_submit_to_delivered() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");

    // The submitter sees exactly their submission, pending team leader.
    let listed = h
        .engine
        .list("alice", &ListFilter::default(), Deadline::none())
        .expect("list");
    assert_eq!(listed.counts.total, 1);
    assert_eq!(
        listed.submissions[0].state,
        SubmissionState::PendingTeamLeader
    );
    assert_eq!(listed.counts.pending_team_leader, 1);

    // The team leader for AGCC sees it too.
    let listed = h
        .engine
        .list("tl_bob", &ListFilter::default(), Deadline::none())
        .expect("list");
    assert!(listed.submissions.iter().any(|s| s.id == id));
    assert!(h.inbox_kinds("tl_bob").contains(&NotificationKind::SubmittedToTl));

    // Team-leader approval forwards to the admin stage and notifies.
    let outcome = h
        .engine
        .tl_approve("tl_bob", &id, Deadline::none())
        .expect("tl approve");
    assert_eq!(outcome.submission.state, SubmissionState::PendingAdmin);
    assert_eq!(outcome.submission.tl_reviewer.as_deref(), Some("tl_bob"));
    assert!(h.inbox_kinds("alice").contains(&NotificationKind::TlApproved));

    // Admin approval delivers the artifact and writes the sidecar.
    let outcome = h
        .engine
        .admin_approve("admin", &id, Deadline::none())
        .expect("admin approve");
    assert_eq!(outcome.submission.state, SubmissionState::Approved);
    assert_eq!(
        outcome.submission.placement_outcome,
        Some(PlacementOutcome::Delivered)
    );

    let year = Utc::now().year();
    let delivered = h.root.join(format!("projects/AGCC/{year:04}/spec.pdf"));
    assert!(delivered.exists(), "artifact delivered to the project tree");
    let sidecar = h
        .root
        .join(format!("share/metadata/AGCC/{year:04}/spec.pdf.meta.json"));
    assert!(sidecar.exists(), "metadata sidecar written");
    assert!(h.inbox_kinds("alice").contains(&NotificationKind::AdminApproved));

    // Terminal entries leave the live queue and land in exactly one
    // archive.
    let listed = h
        .engine
        .list("admin", &ListFilter::default(), Deadline::none())
        .expect("list");
    assert_eq!(listed.counts.total, 0);
    let archived = h
        .engine
        .archived("admin", ArchiveKind::Approved)
        .expect("archive");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, id);
    assert_eq!(
        archived[0].state_history.last().unwrap().state,
        SubmissionState::Approved
    );
    for kind in [
        ArchiveKind::RejectedByAdmin,
        ArchiveKind::RejectedByTeamLeader,
        ArchiveKind::Withdrawn,
    ] {
        assert!(h.engine.archived("admin", kind).expect("archive").is_empty());
    }
}

#[test]
fn wrong_team_leader_is_forbidden() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");

    let err = h
        .engine
        .tl_approve("tl_carol", &id, Deadline::none())
        .expect_err("wrong team must be rejected");
    assert_eq!(err.code(), "FORBIDDEN");

    // State unchanged.
    let sub = h.engine.get("admin", &id).expect("get");
    assert_eq!(sub.state, SubmissionState::PendingTeamLeader);
}

#[test]
fn concurrent_tl_approvals_race_one_winner() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");

    let engine_a = Arc::clone(&h.engine);
    let engine_b = Arc::clone(&h.engine);
    let id_a = id.clone();
    let id_b = id.clone();

    let t_a = std::thread::spawn(move || engine_a.tl_approve("tl_bob", &id_a, Deadline::none()));
    let t_b = std::thread::spawn(move || engine_b.tl_approve("tl_bob", &id_b, Deadline::none()));
    let results = [t_a.join().expect("join"), t_b.join().expect("join")];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one concurrent transition succeeds");
    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one loser");
    assert_eq!(loser.code(), "ILLEGAL_TRANSITION");

    // Exactly one TL_APPROVED notification reached the submitter.
    let tl_approved = h
        .inbox_kinds("alice")
        .into_iter()
        .filter(|k| *k == NotificationKind::TlApproved)
        .count();
    assert_eq!(tl_approved, 1);
}

#[test]
fn rejection_requires_reason() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");
    h.engine
        .tl_approve("tl_bob", &id, Deadline::none())
        .expect("tl approve");

    for empty in ["", "   "] {
        let err = h
            .engine
            .admin_reject("admin", &id, empty, Deadline::none())
            .expect_err("empty reason must fail");
        assert_eq!(err.code(), "BAD_INPUT");
    }

    // State unchanged by the failed attempts.
    let sub = h.engine.get("admin", &id).expect("get");
    assert_eq!(sub.state, SubmissionState::PendingAdmin);

    // A real reason lands in the rejected-admin archive with the reason
    // recorded.
    h.engine
        .admin_reject("admin", &id, "missing revision block", Deadline::none())
        .expect("reject");
    let archived = h
        .engine
        .archived("admin", ArchiveKind::RejectedByAdmin)
        .expect("archive");
    assert_eq!(archived.len(), 1);
    assert_eq!(
        archived[0].admin_rejection_reason.as_deref(),
        Some("missing revision block")
    );
    assert!(h.inbox_kinds("alice").contains(&NotificationKind::AdminRejected));
}

#[test]
fn archive_cap_evicts_oldest() {
    let h = harness_with(|config| config.archive_cap = 10);

    let mut ids = Vec::new();
    for i in 0..15 {
        let id = h.submit("alice", &format!("doc-{i:02}.pdf"));
        h.engine
            .tl_approve("tl_bob", &id, Deadline::none())
            .expect("tl approve");
        h.engine
            .admin_approve("admin", &id, Deadline::none())
            .expect("admin approve");
        ids.push(id);
    }

    let archived = h
        .engine
        .archived("admin", ArchiveKind::Approved)
        .expect("archive");
    assert_eq!(archived.len(), 10, "ring holds exactly the cap");

    // The five oldest were evicted; the ten newest remain.
    for old in &ids[..5] {
        assert!(!archived.iter().any(|r| &r.id == old));
    }
    for recent in &ids[5..] {
        assert!(archived.iter().any(|r| &r.id == recent));
    }
}

#[cfg(unix)]
#[test]
fn placement_fallback_stages_then_promotes() {
    use std::os::unix::fs::PermissionsExt;

    let h = harness();
    let projects = h.root.join("projects");
    std::fs::create_dir_all(&projects).expect("mkdir projects");
    std::fs::set_permissions(&projects, std::fs::Permissions::from_mode(0o555))
        .expect("read-only projects");

    let id = h.submit("alice", "spec.pdf");
    h.engine
        .tl_approve("tl_bob", &id, Deadline::none())
        .expect("tl approve");

    // Approval succeeds even though placement cannot deliver.
    let outcome = h
        .engine
        .admin_approve("admin", &id, Deadline::none())
        .expect("approve succeeds despite placement failure");
    assert_eq!(outcome.submission.state, SubmissionState::Approved);
    assert_eq!(
        outcome.submission.placement_outcome,
        Some(PlacementOutcome::Staged)
    );
    let staged = outcome
        .submission
        .placement_target_path
        .clone()
        .expect("staging path recorded");
    assert!(staged.starts_with(h.root.join("share/staging/AGCC")));
    assert!(staged.exists());

    // Fix permissions; the next sweep promotes the record.
    std::fs::set_permissions(&projects, std::fs::Permissions::from_mode(0o755))
        .expect("restore");
    let stats = h.engine.retry_placements(Deadline::none()).expect("sweep");
    assert_eq!(stats.promoted, 1);

    let year = Utc::now().year();
    let delivered = h.root.join(format!("projects/AGCC/{year:04}/spec.pdf"));
    assert!(delivered.exists());
    assert!(!staged.exists(), "staged copy removed on promotion");

    let record = h
        .engine
        .archived("admin", ArchiveKind::Approved)
        .expect("archive")
        .into_iter()
        .find(|r| r.id == id)
        .expect("archived");
    assert_eq!(record.placement_outcome, Some(PlacementOutcome::Delivered));
    assert_eq!(record.placement_target_path, Some(delivered));
}

#[test]
fn withdraw_only_from_team_leader_stage() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");

    // Someone else's submission cannot be withdrawn.
    let err = h
        .engine
        .withdraw("dave", &id, Deadline::none())
        .expect_err("not the submitter");
    assert_eq!(err.code(), "FORBIDDEN");

    h.engine
        .withdraw("alice", &id, Deadline::none())
        .expect("withdraw");
    let archived = h
        .engine
        .archived("admin", ArchiveKind::Withdrawn)
        .expect("archive");
    assert_eq!(archived.len(), 1);
    assert!(h.inbox_kinds("alice").contains(&NotificationKind::Withdrawn));

    // Past the team-leader stage, withdrawal is an illegal transition.
    let id = h.submit("alice", "late.pdf");
    h.engine
        .tl_approve("tl_bob", &id, Deadline::none())
        .expect("tl approve");
    let err = h
        .engine
        .withdraw("alice", &id, Deadline::none())
        .expect_err("too late to withdraw");
    assert_eq!(err.code(), "ILLEGAL_TRANSITION");
}

#[test]
fn comment_visibility_and_fanout() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");

    // A user with no standing cannot comment.
    let err = h
        .engine
        .add_comment("erin", &id, "drive-by", Deadline::none())
        .expect_err("no standing");
    assert_eq!(err.code(), "FORBIDDEN");

    // Empty bodies are rejected.
    let err = h
        .engine
        .add_comment("admin", &id, "   ", Deadline::none())
        .expect_err("empty body");
    assert_eq!(err.code(), "BAD_INPUT");

    // Admin comments: the submitter is notified.
    h.engine
        .add_comment("admin", &id, "please add a title block", Deadline::none())
        .expect("admin comment");
    assert!(h.inbox_kinds("alice").contains(&NotificationKind::CommentAdded));

    // The submitter replies: the prior commenter is notified, not the
    // author.
    let before = h.inbox_kinds("alice").len();
    h.engine
        .add_comment("alice", &id, "done, re-uploaded", Deadline::none())
        .expect("reply");
    assert!(h.inbox_kinds("admin").contains(&NotificationKind::CommentAdded));
    assert_eq!(
        h.inbox_kinds("alice").len(),
        before,
        "authors are not notified of their own comments"
    );

    // Both participants read the same thread.
    let thread = h.engine.get_comments("alice", &id).expect("thread");
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0].author_username, "admin");
    assert_eq!(thread[1].author_username, "alice");
}

#[test]
fn every_transition_notifies_the_submitter() {
    let h = harness();

    let id = h.submit("alice", "a.pdf");
    assert_eq!(h.inbox_kinds("alice").len(), 1);
    h.engine
        .tl_approve("tl_bob", &id, Deadline::none())
        .expect("tl approve");
    assert_eq!(h.inbox_kinds("alice").len(), 2);
    h.engine
        .admin_approve("admin", &id, Deadline::none())
        .expect("admin approve");
    assert_eq!(h.inbox_kinds("alice").len(), 3);

    let id = h.submit("alice", "b.pdf");
    h.engine
        .tl_reject("tl_bob", &id, "duplicate of a.pdf", Deadline::none())
        .expect("tl reject");
    assert!(h.inbox_kinds("alice").contains(&NotificationKind::TlRejected));
    let archived = h
        .engine
        .archived("admin", ArchiveKind::RejectedByTeamLeader)
        .expect("archive");
    assert_eq!(
        archived[0].tl_rejection_reason.as_deref(),
        Some("duplicate of a.pdf")
    );
}

#[test]
fn mark_read_flips_and_missing_id_is_not_found() {
    let h = harness();
    h.submit("alice", "spec.pdf");

    let inbox = h.engine.get_inbox("alice", true).expect("inbox");
    assert_eq!(inbox.len(), 1);
    let nid = inbox[0].id.clone();

    h.engine
        .mark_read("alice", &nid, Deadline::none())
        .expect("mark read");
    assert!(h.engine.get_inbox("alice", true).expect("inbox").is_empty());
    assert_eq!(h.engine.get_inbox("alice", false).expect("inbox").len(), 1);

    let err = h
        .engine
        .mark_read("alice", "no-such-id", Deadline::none())
        .expect_err("missing notification");
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn unknown_actor_is_rejected_everywhere() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");

    let err = h
        .engine
        .list("ghost", &ListFilter::default(), Deadline::none())
        .expect_err("unknown user");
    assert_eq!(err.code(), "UNKNOWN_USER");
    let err = h
        .engine
        .tl_approve("ghost", &id, Deadline::none())
        .expect_err("unknown user");
    assert_eq!(err.code(), "UNKNOWN_USER");
}

#[test]
fn role_scoped_listing_isolates_users_and_teams() {
    let h = harness();
    h.submit("alice", "a.pdf");
    h.submit("dave", "d.pdf");
    h.submit("erin", "e.pdf");

    let result = h
        .engine
        .list("alice", &ListFilter::default(), Deadline::none())
        .expect("list");
    assert!(result
        .submissions
        .iter()
        .all(|s| s.submitter_username == "alice"));

    let result = h
        .engine
        .list("tl_bob", &ListFilter::default(), Deadline::none())
        .expect("list");
    assert_eq!(result.counts.total, 2);
    assert!(result.submissions.iter().all(|s| s.submitter_team == "AGCC"));

    let result = h
        .engine
        .list("admin", &ListFilter::default(), Deadline::none())
        .expect("list");
    assert_eq!(result.counts.total, 3);
}

#[test]
fn degraded_mode_rejects_writes_but_serves_reads() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, b"x").expect("write blocker");

    let config = EngineConfig {
        // A path under a regular file can never be created or probed.
        network_root: blocker.join("share"),
        local_fallback_root: tmp.path().join("local"),
        project_root: Some(tmp.path().join("projects")),
        ..EngineConfig::default()
    };
    let identity = MemoryIdentityProvider::new().with_user("alice", Role::User, &["AGCC"]);
    let engine = ApprovalEngine::new(config, Arc::new(identity));
    assert!(engine.degraded());

    let upload = tmp.path().join("spec.pdf");
    std::fs::write(&upload, b"bytes").expect("write upload");
    let err = engine
        .submit("alice", &upload, "", vec![], Deadline::none())
        .expect_err("degraded writes are refused");
    assert_eq!(err.code(), "STORE_UNAVAILABLE");

    // Reads still work against the (empty) fallback.
    let listed = engine
        .list("alice", &ListFilter::default(), Deadline::none())
        .expect("read in degraded mode");
    assert_eq!(listed.counts.total, 0);
}

#[test]
fn unsafe_filenames_are_rejected_at_submit() {
    let h = harness();
    // Filename validation runs before the upload is even probed, so the
    // oversized name is rejected without touching the filesystem.
    let long_name = "x".repeat(300);
    let path = h.root.join("share/uploads/alice").join(&long_name);
    let err = h
        .engine
        .submit("alice", &path, "", vec![], Deadline::none())
        .expect_err("oversized filename");
    assert_eq!(err.code(), "BAD_INPUT");

    let err = h
        .engine
        .submit(
            "alice",
            &h.root.join("share/uploads/alice/missing.pdf"),
            "",
            vec![],
            Deadline::none(),
        )
        .expect_err("missing upload");
    assert_eq!(err.code(), "BAD_INPUT");
}

#[test]
fn team_capture_is_immutable_after_submit() {
    let h = harness();
    let id = h.submit("alice", "spec.pdf");
    let sub = h.engine.get("alice", &id).expect("get");
    assert_eq!(sub.submitter_team, "AGCC");

    // Approvals carry the captured team through to archive and delivery,
    // regardless of later identity changes (the engine re-reads identity
    // per operation but never rewrites submitter_team).
    h.engine
        .tl_approve("tl_bob", &id, Deadline::none())
        .expect("tl approve");
    h.engine
        .admin_approve("admin", &id, Deadline::none())
        .expect("admin approve");
    let record = h
        .engine
        .archived("admin", ArchiveKind::Approved)
        .expect("archive")
        .pop()
        .expect("archived");
    assert_eq!(record.submitter_team, "AGCC");
}

#[test]
fn non_user_roles_cannot_submit() {
    let h = harness();
    let upload = h.upload("tl_bob", "tool.zip");
    let err = h
        .engine
        .submit("tl_bob", &upload, "", vec![], Deadline::none())
        .expect_err("team leaders do not submit");
    assert_eq!(err.code(), "FORBIDDEN");

    let err = h
        .engine
        .tl_approve("alice", "whatever", Deadline::none())
        .expect_err("users do not review");
    assert_eq!(err.code(), "FORBIDDEN");

    let err = h
        .engine
        .admin_approve("tl_bob", "whatever", Deadline::none())
        .expect_err("team leaders do not render admin decisions");
    assert_eq!(err.code(), "FORBIDDEN");
}
