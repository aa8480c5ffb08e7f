//! Workspace uploads, quotas and sandbox mirroring.

mod common;

use futures::StreamExt;
use sandboxd::CoreError;
use sandboxd::settings::KEY_AGENT_SYSTEM_INSTRUCTIONS;
use sandboxd::workspace::{
    COMMANDS_DIR, INSTRUCTIONS_PATH, OUTPUT_DIR, OutputAction, PRIVATE_DIR, PUBLIC_DIR,
    QuotaDefaults, QuotaScope, SHARED_DIR, WorkspaceTarget,
};
use std::time::Duration;
use tokio::sync::oneshot;

mod quotas {
    use super::*;

    #[tokio::test]
    async fn oversized_upload_changes_nothing() {
        let t = common::engine_with_quotas(QuotaDefaults {
            max_bytes: 10,
            max_file_count: 100,
        })
        .await;
        let agent = t.agent(1, "").await;
        let target = WorkspaceTarget::Private {
            user_id: 1,
            agent_id: agent.id,
        };
        let scope = QuotaScope::Agent {
            user_id: 1,
            agent_id: agent.id,
        };

        t.engine
            .workspace
            .upload(1, target, "notes.txt", b"1234", "")
            .await
            .unwrap();
        let before = t.engine.workspace.quota(scope).await.unwrap();
        assert_eq!(before.used_bytes, 4);
        assert_eq!(before.file_count, 1);

        let err = t
            .engine
            .workspace
            .upload(1, target, "big.bin", b"0123456789a", "")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));

        let after = t.engine.workspace.quota(scope).await.unwrap();
        assert_eq!(after, before);
        let key = target.object_key("big.bin");
        assert!(t.objects.path().join(&key).symlink_metadata().is_err());
    }

    #[tokio::test]
    async fn file_count_ceiling_applies_to_groups() {
        let t = common::engine_with_quotas(QuotaDefaults {
            max_bytes: 1 << 20,
            max_file_count: 1,
        })
        .await;
        let group = t.engine.agents.create_group("research", "").await.unwrap();
        let target = WorkspaceTarget::Group { group_id: group.id };

        t.engine
            .workspace
            .upload(1, target, "a.txt", b"a", "text/plain")
            .await
            .unwrap();
        let err = t
            .engine
            .workspace
            .upload(1, target, "b.txt", b"b", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn delete_releases_quota() {
        let t = common::engine().await;
        let agent = t.agent(1, "").await;
        let target = WorkspaceTarget::Private {
            user_id: 1,
            agent_id: agent.id,
        };
        t.engine
            .workspace
            .upload(1, target, "docs/a.md", b"hello", "")
            .await
            .unwrap();
        t.engine
            .workspace
            .upload(1, target, "docs/b.md", b"world!", "")
            .await
            .unwrap();

        let removed = t.engine.workspace.delete(target, "docs/").await.unwrap();
        assert_eq!(removed, 2);
        let quota = t
            .engine
            .workspace
            .quota(QuotaScope::Agent {
                user_id: 1,
                agent_id: agent.id,
            })
            .await
            .unwrap();
        assert_eq!(quota.used_bytes, 0);
        assert_eq!(quota.file_count, 0);
    }

    #[tokio::test]
    async fn directory_delete_matches_case() {
        let t = common::engine().await;
        let agent = t.agent(1, "").await;
        let session = t
            .engine
            .sessions
            .create_or_reuse_session(1, agent.id)
            .await
            .unwrap();
        let target = WorkspaceTarget::Private {
            user_id: 1,
            agent_id: agent.id,
        };
        t.engine
            .workspace
            .upload(1, target, "docs/keep.txt", b"12345", "")
            .await
            .unwrap();
        t.engine
            .workspace
            .upload(1, target, "Docs/gone.txt", b"x", "")
            .await
            .unwrap();
        t.settle().await;

        let removed = t.engine.workspace.delete(target, "Docs/").await.unwrap();
        assert_eq!(removed, 1);
        t.settle().await;

        let quota = t
            .engine
            .workspace
            .quota(QuotaScope::Agent {
                user_id: 1,
                agent_id: agent.id,
            })
            .await
            .unwrap();
        assert_eq!(quota.used_bytes, 5);
        assert_eq!(quota.file_count, 1);
        assert!(t.objects.path().join(target.object_key("docs/keep.txt")).exists());

        let kept = format!("{PRIVATE_DIR}/docs/keep.txt");
        let gone = format!("{PRIVATE_DIR}/Docs/gone.txt");
        assert!(t.cluster.read_file(&session.pod_name, &kept).is_some());
        assert!(t.cluster.read_file(&session.pod_name, &gone).is_none());
    }

    #[tokio::test]
    async fn empty_path_is_rejected() {
        let t = common::engine().await;
        let err = t
            .engine
            .workspace
            .upload(1, WorkspaceTarget::Public, " / ", b"x", "")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}

mod mirroring {
    use super::*;

    #[tokio::test]
    async fn new_sandbox_receives_every_namespace() {
        let t = common::engine().await;
        let agent = t.agent(1, "").await;
        let group = t.engine.agents.create_group("research", "").await.unwrap();
        t.engine
            .agents
            .add_group_member(group.id, 1, "member")
            .await
            .unwrap();

        let private = WorkspaceTarget::Private {
            user_id: 1,
            agent_id: agent.id,
        };
        let uploads = [
            (private, "plan.md"),
            (private, "claude-commands/deploy.md"),
            (WorkspaceTarget::Public, "handbook.pdf"),
            (WorkspaceTarget::Shared, "data/prices.csv"),
            (WorkspaceTarget::Group { group_id: group.id }, "roadmap.md"),
        ];
        for (target, path) in uploads {
            t.engine
                .workspace
                .upload(1, target, path, path.as_bytes(), "")
                .await
                .unwrap();
        }
        t.settle().await;

        let session = t
            .engine
            .sessions
            .create_or_reuse_session(1, agent.id)
            .await
            .unwrap();
        let pod = session.pod_name;

        for path in [
            format!("{PRIVATE_DIR}/plan.md"),
            format!("{COMMANDS_DIR}/deploy.md"),
            format!("{PUBLIC_DIR}/handbook.pdf"),
            format!("{SHARED_DIR}/data/prices.csv"),
            format!("/workspace/group/{}/roadmap.md", group.id),
        ] {
            assert!(t.cluster.read_file(&pod, &path).is_some(), "missing {path}");
        }
        assert!(t.cluster.has_dir(&pod, OUTPUT_DIR));
    }

    #[tokio::test]
    async fn uploads_fan_out_to_running_sandboxes() {
        let t = common::engine().await;
        let mine = t.agent(1, "").await;
        let theirs = t.agent(2, "").await;
        let a = t
            .engine
            .sessions
            .create_or_reuse_session(1, mine.id)
            .await
            .unwrap();
        let b = t
            .engine
            .sessions
            .create_or_reuse_session(2, theirs.id)
            .await
            .unwrap();

        t.engine
            .workspace
            .upload(9, WorkspaceTarget::Public, "notice.txt", b"maintenance at 5", "")
            .await
            .unwrap();
        t.engine
            .workspace
            .upload(
                1,
                WorkspaceTarget::Private {
                    user_id: 1,
                    agent_id: mine.id,
                },
                "secret.txt",
                b"mine",
                "",
            )
            .await
            .unwrap();
        t.settle().await;

        let notice = format!("{PUBLIC_DIR}/notice.txt");
        assert_eq!(
            t.cluster.read_file(&a.pod_name, &notice).as_deref(),
            Some(&b"maintenance at 5"[..])
        );
        assert!(t.cluster.read_file(&b.pod_name, &notice).is_some());

        let secret = format!("{PRIVATE_DIR}/secret.txt");
        assert!(t.cluster.read_file(&a.pod_name, &secret).is_some());
        assert!(t.cluster.read_file(&b.pod_name, &secret).is_none());

        t.engine
            .workspace
            .delete(WorkspaceTarget::Public, "notice.txt")
            .await
            .unwrap();
        t.settle().await;
        assert!(t.cluster.read_file(&a.pod_name, &notice).is_none());
        assert!(t.cluster.read_file(&b.pod_name, &notice).is_none());
    }

    #[tokio::test]
    async fn reupload_during_push_reaches_sandbox() {
        let t = common::engine().await;
        let agent = t.agent(1, "").await;
        let session = t
            .engine
            .sessions
            .create_or_reuse_session(1, agent.id)
            .await
            .unwrap();
        let target = WorkspaceTarget::Private {
            user_id: 1,
            agent_id: agent.id,
        };
        t.engine
            .workspace
            .upload(1, target, "a.txt", b"v1", "")
            .await
            .unwrap();
        t.settle().await;

        // Keep the path's fan-out busy while the new version arrives
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        t.engine.pool.submit(
            format!("workspace:{}", target.object_key("a.txt")),
            async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            },
        );
        started_rx.await.unwrap();
        t.engine
            .workspace
            .upload(1, target, "a.txt", b"v2", "")
            .await
            .unwrap();
        release_tx.send(()).unwrap();
        t.settle().await;

        let path = format!("{PRIVATE_DIR}/a.txt");
        assert_eq!(
            t.cluster.read_file(&session.pod_name, &path).as_deref(),
            Some(&b"v2"[..])
        );
    }

    #[tokio::test]
    async fn queued_upload_and_delete_mirror_the_final_state() {
        let t = common::engine().await;
        let agent = t.agent(1, "").await;
        let session = t
            .engine
            .sessions
            .create_or_reuse_session(1, agent.id)
            .await
            .unwrap();
        let target = WorkspaceTarget::Private {
            user_id: 1,
            agent_id: agent.id,
        };
        t.engine
            .workspace
            .upload(1, target, "b.txt", b"v0", "")
            .await
            .unwrap();
        t.settle().await;
        let path = format!("{PRIVATE_DIR}/b.txt");
        assert!(t.cluster.read_file(&session.pod_name, &path).is_some());

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        t.engine.pool.submit(
            format!("workspace:{}", target.object_key("b.txt")),
            async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            },
        );
        started_rx.await.unwrap();

        t.engine
            .workspace
            .upload(1, target, "b.txt", b"draft", "")
            .await
            .unwrap();
        t.engine.workspace.delete(target, "b.txt").await.unwrap();
        release_tx.send(()).unwrap();
        t.settle().await;

        assert!(t.cluster.read_file(&session.pod_name, &path).is_none());
    }

    #[tokio::test]
    async fn instructions_combine_system_group_and_agent() {
        let t = common::engine().await;
        t.engine
            .settings
            .repository()
            .set_system(KEY_AGENT_SYSTEM_INSTRUCTIONS, "Be careful.")
            .await
            .unwrap();
        let group = t
            .engine
            .agents
            .create_group("legal", "Cite sources.")
            .await
            .unwrap();
        t.engine
            .agents
            .add_group_member(group.id, 1, "member")
            .await
            .unwrap();
        let agent = t.agent(1, "Write briefs.").await;

        let session = t
            .engine
            .sessions
            .create_or_reuse_session(1, agent.id)
            .await
            .unwrap();
        let content = t
            .cluster
            .read_file(&session.pod_name, INSTRUCTIONS_PATH)
            .unwrap();
        assert_eq!(
            String::from_utf8(content).unwrap(),
            "Be careful.\n\n---\n\nCite sources.\n\n---\n\nWrite briefs."
        );
    }
}

mod output {
    use super::*;

    #[tokio::test]
    async fn output_files_are_restored_into_new_sandbox() {
        let t = common::engine().await;
        let agent = t.agent(1, "").await;
        let mut events = Box::pin(t.engine.workspace.subscribe_output(1, agent.id));

        t.engine
            .workspace
            .ingest_output(1, agent.id, "charts/q3.png", b"png-bytes", "")
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.action, OutputAction::Upload);
        assert_eq!(event.name, "q3.png");
        assert_eq!(event.path, "charts/q3.png");

        let session = t
            .engine
            .sessions
            .create_or_reuse_session(1, agent.id)
            .await
            .unwrap();
        let restored = t
            .cluster
            .read_file(&session.pod_name, &format!("{OUTPUT_DIR}/charts/q3.png"))
            .unwrap();
        assert_eq!(restored, b"png-bytes");
        // Output files are not mirrored into the private directory
        assert!(
            t.cluster
                .read_file(&session.pod_name, &format!("{PRIVATE_DIR}/output/charts/q3.png"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn removed_output_is_not_restored() {
        let t = common::engine().await;
        let agent = t.agent(1, "").await;
        t.engine
            .workspace
            .ingest_output(1, agent.id, "a.txt", b"a", "")
            .await
            .unwrap();
        t.engine
            .workspace
            .ingest_output(1, agent.id, "b.txt", b"b", "")
            .await
            .unwrap();
        assert_eq!(
            t.engine
                .workspace
                .remove_output(1, agent.id, "a.txt")
                .await
                .unwrap(),
            1
        );

        let report = t
            .engine
            .workspace_sync
            .restore_output_files(1, agent.id)
            .await;
        assert_eq!(report.total, 1);
    }
}
