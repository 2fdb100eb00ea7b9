use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use common::storage::{DirMode, StorageError};
use refstore::files::{FileIndex, StorageService};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::common::{TestStore, files_on_disk};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

/// Yields `data` and then fails, like a client that disconnects mid-upload.
struct AbortedUpload {
    data: Vec<u8>,
    sent: bool,
}

impl AsyncRead for AbortedUpload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "client went away",
            )));
        }
        buf.put_slice(&self.data);
        self.sent = true;
        Poll::Ready(Ok(()))
    }
}

async fn read_all(service: &StorageService, ref_path: &str) -> Vec<u8> {
    let mut resource = service.load_as_resource(ref_path).await.unwrap();
    let mut bytes = Vec::new();
    resource.file.read_to_end(&mut bytes).await.unwrap();
    bytes
}

/// I1-I3 over the current contents of the store.
async fn assert_consistent(store: &TestStore) {
    let records = store.all_records().await;
    let mut recorded = HashSet::new();

    for record in &records {
        let path = std::path::Path::new(&record.filepath);
        assert!(path.is_file(), "record {} has no file", record.filepath);
        assert!(path.starts_with(&store.root));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            record.stored_filename
        );
        assert!(recorded.insert(path.to_path_buf()), "duplicate record");
    }

    let on_disk: HashSet<_> = files_on_disk(&store.root).into_iter().collect();
    assert_eq!(on_disk, recorded);
}

mod store {
    use super::*;

    #[tokio::test]
    async fn store_writes_file_and_record() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let record = service
            .store(PNG, "avatar.png", "users/42/avatar.png")
            .await
            .unwrap();

        let expected_path = store.path_of("users/42/avatar.png");
        assert_eq!(record.original_filename, "avatar.png");
        assert_eq!(record.stored_filename, "avatar.png");
        assert_eq!(record.filepath, expected_path.to_str().unwrap());
        assert_eq!(std::fs::read(&expected_path).unwrap(), PNG);
        assert_eq!(store.record_count().await, 1);
        assert_consistent(&store).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn created_directories_get_configured_mode() {
        use std::os::unix::fs::PermissionsExt;

        let store = TestStore::new().await;
        let service = store.service().await;

        service
            .store(PNG, "avatar.png", "users/42/avatar.png")
            .await
            .unwrap();

        for dir in ["users", "users/42"] {
            let mode = std::fs::metadata(store.path_of(dir))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o750, "{dir}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn existing_directories_keep_their_mode() {
        use std::os::unix::fs::PermissionsExt;

        let store = TestStore::new().await;
        let mut config = store.storage_config();
        config.dir_mode = "rwx------".parse::<DirMode>().unwrap();
        let service = store.service_with(config).await;

        let users = store.path_of("users");
        std::fs::create_dir_all(&users).unwrap();
        std::fs::set_permissions(&users, std::fs::Permissions::from_mode(0o755)).unwrap();

        service.store(PNG, "a.png", "users/7/a.png").await.unwrap();

        let mode_of = |p: &std::path::Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode_of(&users), 0o755);
        assert_eq!(mode_of(&store.path_of("users/7")), 0o700);
    }

    #[tokio::test]
    async fn duplicate_store_conflicts_and_keeps_first_bytes() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service
            .store(&b"first"[..], "a.txt", "docs/a.txt")
            .await
            .unwrap();
        let err = service
            .store(&b"second"[..], "a.txt", "docs/a.txt")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(err.to_string(), "File with the same name already exists.");
        assert_eq!(read_all(&service, "docs/a.txt").await, b"first");
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn equivalent_references_share_one_record() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "x.png", "a/b/x.png").await.unwrap();
        let err = service
            .store(PNG, "x.png", "a/./c/../b/x.png")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn empty_upload_is_rejected_without_side_effects() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let err = service
            .store(&b""[..], "empty.txt", "docs/empty.txt")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::EmptyUpload));
        assert_eq!(store.record_count().await, 0);
        assert!(!store.path_of("docs").exists());
    }

    #[tokio::test]
    async fn blank_original_filename_defaults_to_stored_name() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let record = service.store(PNG, "  ", "pics/cat.png").await.unwrap();
        assert_eq!(record.original_filename, "cat.png");

        let record = service.store(PNG, "Kitty.PNG", "pics/cat2.png").await.unwrap();
        assert_eq!(record.original_filename, "Kitty.PNG");
        assert_eq!(record.stored_filename, "cat2.png");
    }

    #[tokio::test]
    async fn reference_to_root_is_rejected() {
        let store = TestStore::new().await;
        let service = store.service().await;

        for ref_path in ["", ".", "a/.."] {
            let err = service.store(PNG, "x", ref_path).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidReference(_)), "{ref_path:?}");
        }
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_rolled_back() {
        let store = TestStore::new().await;
        let mut config = store.storage_config();
        config.max_upload_size = 4;
        let service = store.service_with(config).await;

        let err = service
            .store(&b"12345"[..], "big.bin", "big.bin")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::SizeLimitExceeded { limit: 4, .. }));
        assert_eq!(store.record_count().await, 0);
        assert!(!store.path_of("big.bin").exists());

        service
            .store(&b"1234"[..], "ok.bin", "ok.bin")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn aborted_upload_leaves_no_row_and_no_file() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let reader = AbortedUpload {
            data: b"partial".to_vec(),
            sent: false,
        };
        let err = service
            .store(reader, "p.bin", "uploads/p.bin")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(store.record_count().await, 0);
        assert!(!store.path_of("uploads/p.bin").exists());
        let staged: Vec<_> = std::fs::read_dir(service.root().join(".staging"))
            .unwrap()
            .collect();
        assert!(staged.is_empty());

        // The path is free again afterwards.
        service.store(PNG, "p.bin", "uploads/p.bin").await.unwrap();
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn concurrent_stores_of_one_reference_admit_one() {
        let store = TestStore::new().await;
        let service = Arc::new(store.service().await);

        let tasks: Vec<_> = (0..8u8)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    let body = vec![i + 1; 1024];
                    service
                        .store(body.as_slice(), "race.bin", "race/race.bin")
                        .await
                        .map(|_| i)
                })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(i) => winners.push(i),
                Err(StorageError::Conflict(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(read_all(&service, "race/race.bin").await, vec![winners[0] + 1; 1024]);
        assert_eq!(store.record_count().await, 1);
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn stalled_upload_does_not_block_other_requests() {
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;
        use tokio::time::timeout;

        let store = TestStore::new().await;
        let service = Arc::new(store.service().await);

        // The client sends a few bytes and then goes quiet without closing.
        let (mut client, body) = tokio::io::duplex(64);
        client.write_all(b"partial").await.unwrap();
        let stalled = tokio::spawn({
            let service = service.clone();
            async move { service.store(body, "slow.bin", "uploads/slow.bin").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored = timeout(
            Duration::from_secs(5),
            service.store(PNG, "fast.png", "uploads/fast.png"),
        )
        .await
        .expect("store waited on a stalled upload");
        assert!(stored.is_ok());

        let lookup = timeout(Duration::from_secs(5), service.get_file_details("fast.png"))
            .await
            .expect("lookup waited on a stalled upload");
        assert_eq!(lookup.unwrap().original_filename, "fast.png");

        stalled.abort();
        assert!(stalled.await.unwrap_err().is_cancelled());
        drop(client);

        let staged: Vec<_> = std::fs::read_dir(service.root().join(".staging"))
            .unwrap()
            .collect();
        assert!(staged.is_empty());
        assert!(!store.path_of("uploads/slow.bin").exists());
        assert_eq!(store.record_count().await, 1);
        assert_consistent(&store).await;
    }
}

mod references {
    use super::*;

    #[tokio::test]
    async fn dot_dot_inside_root_is_accepted() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let record = service
            .store(PNG, "x.png", "a/b/../c/x.png")
            .await
            .unwrap();
        assert_eq!(record.filepath, store.path_of("a/c/x.png").to_str().unwrap());
        assert!(service.load("a/c/x.png").await.is_ok());
    }

    #[tokio::test]
    async fn escaping_references_are_rejected_without_side_effects() {
        let store = TestStore::new().await;
        let service = store.service().await;

        for ref_path in ["../../etc/passwd", "a/../../x", "..", "/etc/passwd"] {
            let err = service.store(PNG, "x", ref_path).await.unwrap_err();
            assert!(
                matches!(err, StorageError::InvalidReference(_)),
                "{ref_path}: {err:?}"
            );
        }

        assert_eq!(store.record_count().await, 0);
        assert!(files_on_disk(&store.root).is_empty());
    }

    #[tokio::test]
    async fn staging_area_is_not_addressable() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let err = service.store(PNG, "x", ".staging/x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidReference(_)));
        assert!(matches!(
            service.load_all_files_under_path(".staging").await,
            Err(StorageError::InvalidReference(_))
        ));
    }
}

mod load {
    use super::*;

    #[tokio::test]
    async fn load_returns_path_with_stored_bytes() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a.png", "img/a.png").await.unwrap();

        let path = service.load("img/a.png").await.unwrap();
        assert_eq!(path, store.path_of("img/a.png"));
        assert_eq!(std::fs::read(path).unwrap(), PNG);
    }

    #[tokio::test]
    async fn load_of_missing_or_directory_is_not_found() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a.png", "img/a.png").await.unwrap();

        assert!(matches!(
            service.load("img/b.png").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            service.load("img").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            service.load_as_resource("nope.png").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resource_surfaces_reference_path() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service
            .store(PNG, "avatar.png", "users/42/avatar.png")
            .await
            .unwrap();

        let resource = service
            .load_as_resource("users/42/avatar.png")
            .await
            .unwrap();
        assert_eq!(resource.ref_path, "users/42/avatar.png");
        assert_eq!(resource.len, PNG.len() as u64);
        assert_eq!(read_all(&service, "users/42/avatar.png").await, PNG);
    }
}

mod listing {
    use super::*;

    async fn list(service: &StorageService, ref_dir: &str) -> HashSet<String> {
        service
            .load_all_files_under_path(ref_dir)
            .await
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn lists_exactly_the_stored_references() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let refs = [
            "users/42/avatar.png",
            "users/42/docs/cv.pdf",
            "users/42/docs/old/letter.txt",
            "users/7/avatar.png",
        ];
        for r in refs {
            service.store(PNG, "f", r).await.unwrap();
        }

        assert_eq!(
            list(&service, "users/42").await,
            set(&refs[..3])
        );
        assert_eq!(list(&service, "users/42/docs/old").await, set(&[refs[2]]));
        assert_eq!(list(&service, "").await, set(&refs));
    }

    #[tokio::test]
    async fn listing_skips_staging_leftovers() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "f", "a.png").await.unwrap();
        std::fs::write(service.root().join(".staging").join("stale.part"), b"x").unwrap();

        assert_eq!(list(&service, "").await, set(&["a.png"]));
    }

    #[tokio::test]
    async fn listing_missing_directory_is_io_failure() {
        let store = TestStore::new().await;
        let service = store.service().await;

        assert!(matches!(
            service.load_all_files_under_path("nothing/here").await,
            Err(StorageError::Io(_))
        ));
    }

    #[tokio::test]
    async fn listing_escaping_directory_is_rejected() {
        let store = TestStore::new().await;
        let service = store.service().await;

        assert!(matches!(
            service.load_all_files_under_path("../").await,
            Err(StorageError::InvalidReference(_))
        ));
    }
}

mod delete {
    use super::*;

    #[tokio::test]
    async fn delete_restores_pre_store_state() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service
            .store(PNG, "avatar.png", "users/42/avatar.png")
            .await
            .unwrap();
        service.delete_file("users/42/avatar.png").await.unwrap();

        assert_eq!(store.record_count().await, 0);
        assert!(!store.path_of("users/42/avatar.png").exists());
        assert!(matches!(
            service.load("users/42/avatar.png").await,
            Err(StorageError::NotFound(_))
        ));

        // The reference can be used again.
        service
            .store(PNG, "avatar.png", "users/42/avatar.png")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_without_record_is_not_found() {
        let store = TestStore::new().await;
        let service = store.service().await;

        std::fs::create_dir_all(&store.root).unwrap();
        std::fs::write(store.path_of("stray.txt"), b"untracked").unwrap();

        assert!(matches!(
            service.delete_file("stray.txt").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.path_of("stray.txt").exists());
    }

    #[tokio::test]
    async fn delete_with_missing_file_removes_record() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a.png", "img/a.png").await.unwrap();
        std::fs::remove_file(store.path_of("img/a.png")).unwrap();

        service.delete_file("img/a.png").await.unwrap();
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn delete_leaves_other_files_alone() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a", "img/a.png").await.unwrap();
        service.store(PNG, "b", "img/b.png").await.unwrap();
        service.delete_file("img/a.png").await.unwrap();

        assert_eq!(store.record_count().await, 1);
        assert!(store.path_of("img/b.png").exists());
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn failed_record_removal_after_file_removal_is_reported() {
        use sea_orm::ConnectionTrait;

        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a.png", "img/a.png").await.unwrap();
        store
            .db
            .execute_unprepared(
                "CREATE TRIGGER keep_file_records BEFORE DELETE ON file_record \
                 BEGIN SELECT RAISE(ABORT, 'records are read-only'); END",
            )
            .await
            .unwrap();

        let result = service.delete_file("img/a.png").await;

        assert!(matches!(result, Err(StorageError::Index(_))), "{result:?}");
        assert!(!store.path_of("img/a.png").exists());
        assert_eq!(store.record_count().await, 1);

        let report = service.audit().await.unwrap();
        assert_eq!(report.missing_files.len(), 1);
    }
}

mod details {
    use super::*;

    #[tokio::test]
    async fn details_are_found_by_stored_filename() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let stored = service
            .store(PNG, "Holiday.png", "photos/2024/beach.png")
            .await
            .unwrap();

        let found = service.get_file_details("beach.png").await.unwrap();
        assert_eq!(found, stored);
        assert!(matches!(
            service.get_file_details("missing.png").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ambiguous_stored_filename_is_an_integrity_violation() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a", "u1/avatar.png").await.unwrap();
        service.store(PNG, "b", "u2/avatar.png").await.unwrap();

        assert!(matches!(
            service.get_file_details("avatar.png").await,
            Err(StorageError::IntegrityViolation(_))
        ));
    }

    #[tokio::test]
    async fn update_changes_only_original_filename() {
        let store = TestStore::new().await;
        let service = store.service().await;

        let stored = service.store(PNG, "old.png", "x/pic.png").await.unwrap();
        let updated = service
            .update_file_details("pic.png", "new name.png")
            .await
            .unwrap();

        assert_eq!(updated.id, stored.id);
        assert_eq!(updated.original_filename, "new name.png");
        assert_eq!(updated.stored_filename, stored.stored_filename);
        assert_eq!(updated.filepath, stored.filepath);
        assert_eq!(
            service.get_file_details("pic.png").await.unwrap(),
            updated
        );
        assert!(matches!(
            service.update_file_details("nope.png", "x").await,
            Err(StorageError::NotFound(_))
        ));
    }
}

mod audit {
    use super::*;
    use sea_orm::{ActiveModelTrait, Set};
    use refstore::entity::file_record;

    #[tokio::test]
    async fn audit_of_consistent_store_is_clean() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a", "a.png").await.unwrap();
        service.store(PNG, "b", "d/b.png").await.unwrap();

        let report = service.audit().await.unwrap();
        assert_eq!(report.checked, 2);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn audit_reports_missing_and_malformed_records() {
        let store = TestStore::new().await;
        let service = store.service().await;

        service.store(PNG, "a", "a.png").await.unwrap();
        service.store(PNG, "b", "d/b.png").await.unwrap();
        std::fs::remove_file(store.path_of("d/b.png")).unwrap();

        file_record::ActiveModel {
            original_filename: Set("x".into()),
            stored_filename: Set("passwd".into()),
            filepath: Set("/etc/passwd".into()),
            ..Default::default()
        }
        .insert(&store.db)
        .await
        .unwrap();

        let report = service.audit().await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.missing_files.len(), 1);
        assert_eq!(report.missing_files[0].stored_filename, "b.png");
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.malformed[0].filepath, "/etc/passwd");

        // Read-only: nothing was repaired.
        assert_eq!(store.record_count().await, 3);
    }
}

mod index {
    use super::*;
    use refstore::files::NewFileRecord;

    #[tokio::test]
    async fn insert_rejects_duplicate_filepath() {
        let store = TestStore::new().await;
        let index = FileIndex::new(&store.db);

        let record = NewFileRecord {
            original_filename: "a",
            stored_filename: "a.png",
            filepath: "/r/a.png",
        };
        let first = index.insert(record).await.unwrap();
        assert!(first.id > 0);

        assert!(matches!(
            index.insert(record).await,
            Err(StorageError::IntegrityViolation(_))
        ));
        assert_eq!(
            index.find_by_filepath("/r/a.png").await.unwrap(),
            Some(first.clone())
        );
        assert!(index.delete(&first).await.unwrap());
        assert!(!index.delete(&first).await.unwrap());
        assert_eq!(index.find_by_filepath("/r/a.png").await.unwrap(), None);
    }
}

mod scenarios {
    use super::*;

    /// The end-to-end walk: store, duplicate, read back, list, delete, escape.
    #[tokio::test]
    async fn avatar_lifecycle() {
        let store = TestStore::new().await;
        let service = store.service().await;
        let avatar = "users/42/avatar.png";

        // 1
        let record = service.store(PNG, "avatar.png", avatar).await.unwrap();
        assert_eq!(record.filepath, store.path_of(avatar).to_str().unwrap());

        // 2
        let err = service
            .store(&b"other"[..], "avatar.png", avatar)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(std::fs::read(store.path_of(avatar)).unwrap(), PNG);

        // 3
        let resource = service.load_as_resource(avatar).await.unwrap();
        assert_eq!(resource.ref_path, avatar);
        assert_eq!(read_all(&service, avatar).await, PNG);

        // 4
        let listed: Vec<String> = service
            .load_all_files_under_path("users/42")
            .await
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(listed, vec![avatar.to_string()]);

        // 5
        service.delete_file(avatar).await.unwrap();
        assert!(matches!(
            service.load(avatar).await,
            Err(StorageError::NotFound(_))
        ));

        // 6
        let err = service
            .store(PNG, "passwd", "../../etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidReference(_)));
        assert_eq!(store.record_count().await, 0);
        assert_consistent(&store).await;
    }
}

mod startup {
    use super::*;
    use refstore::config::StorageConfig;

    #[tokio::test]
    async fn blank_location_is_invalid_configuration() {
        let store = TestStore::new().await;

        for location in ["", "   "] {
            let result = StorageService::new(store.db.clone(), &StorageConfig::new(location)).await;
            assert!(matches!(
                result,
                Err(StorageError::InvalidConfiguration(_))
            ));
        }
    }

    #[tokio::test]
    async fn root_is_created_on_startup() {
        let store = TestStore::new().await;
        assert!(!store.root.exists());

        let service = store.service().await;
        assert!(store.root.is_dir());
        assert_eq!(service.root(), store.root.as_path());
    }
}
