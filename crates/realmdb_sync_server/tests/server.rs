//! Protocol-level tests against a running server.

use realmdb_core::{ObjectSchema, Property, PropertyType, Schema, Value};
use realmdb_sync_protocol::{
    BatchState, BindMode, Changeset, ClientMessage, DownloadCursor, FileIdent, Payload,
    PrimaryKeyValue, ProtocolErrorCode, QuerySpec, ServerMessage, ServerRequestsAction,
    SyncOperation, UploadCursor, PROTOCOL_VERSION,
};
use realmdb_sync_server::{ServerConfig, ServerConnection, ServerError, SyncServer};
use tempfile::TempDir;

fn schema() -> Schema {
    Schema::new(vec![ObjectSchema::new("Task")
        .property(Property::new("_id", PropertyType::Int).primary_key())
        .property(Property::new("title", PropertyType::String))
        .property(Property::new("done", PropertyType::Bool))])
}

fn start(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> (TempDir, SyncServer) {
    let dir = TempDir::new().unwrap();
    let config = configure(ServerConfig::new(dir.path().join("server"), schema()));
    let server = SyncServer::start(config).unwrap();
    (dir, server)
}

fn exchange(connection: &ServerConnection, message: &ClientMessage) -> Vec<ServerMessage> {
    connection
        .send(&message.encode().unwrap())
        .unwrap()
        .iter()
        .map(|frame| ServerMessage::decode(frame).unwrap())
        .collect()
}

fn bind(session: u64, mode: BindMode, token: &str, file_ident: Option<FileIdent>, server_version: u64) -> ClientMessage {
    ClientMessage::Bind {
        session,
        path: "/client/default.realm".into(),
        mode,
        access_token: token.into(),
        file_ident,
        download: DownloadCursor {
            server_version,
            last_integrated_client_version: 0,
        },
        query: None,
        protocol_version: PROTOCOL_VERSION,
    }
}

fn partition() -> BindMode {
    BindMode::Partition("team".into())
}

fn task(key: i64, title: &str, done: bool) -> SyncOperation {
    SyncOperation::upsert("Task", PrimaryKeyValue::Int(key))
        .with_field("title", Payload::String(title.into()))
        .with_field("done", Payload::Bool(done))
}

fn upload(session: u64, client_version: u64, operations: Vec<SyncOperation>) -> ClientMessage {
    ClientMessage::Upload {
        session,
        progress: UploadCursor {
            client_version,
            last_integrated_server_version: 0,
        },
        changesets: vec![Changeset {
            client_version,
            last_integrated_server_version: 0,
            origin_timestamp: 0,
            operations,
        }],
    }
}

fn ident_of(replies: &[ServerMessage]) -> FileIdent {
    replies
        .iter()
        .find_map(|m| match m {
            ServerMessage::Ident { file_ident, .. } => Some(*file_ident),
            _ => None,
        })
        .expect("no ident message")
}

fn error_of(replies: &[ServerMessage]) -> &realmdb_sync_protocol::ErrorMessage {
    replies
        .iter()
        .find_map(|m| match m {
            ServerMessage::Error(error) => Some(error),
            _ => None,
        })
        .expect("no error message")
}

#[test]
fn fresh_client_gets_ident_and_bootstrap() {
    let (_dir, server) = start(|c| c);
    let version = server
        .write(Some("team"), |realm| {
            realm.create_object_with_primary_key("Task", 1)?.set_value("title", "seeded")?;
            Ok(())
        })
        .unwrap();
    assert_eq!(version, 1);

    let connection = server.connect().unwrap();
    let token = server.issue_token("alice");
    let replies = exchange(&connection, &bind(1, partition(), &token, None, 0));
    assert!(matches!(replies[0], ServerMessage::Ident { session: 1, .. }));
    let ServerMessage::Download {
        progress,
        batch_state,
        changesets,
        ..
    } = &replies[1]
    else {
        panic!("expected bootstrap, got {:?}", replies[1]);
    };
    assert_eq!(progress.server_version, 1);
    assert_eq!(*batch_state, BatchState::LastInBatch);
    assert_eq!(changesets[0].operations.len(), 1);
    assert_eq!(changesets[0].operations[0].key(), &PrimaryKeyValue::Int(1));
}

#[test]
fn uploads_are_acknowledged_and_forwarded() {
    let (_dir, server) = start(|c| c);
    let token = server.issue_token("alice");
    let first = server.connect().unwrap();
    let second = server.connect().unwrap();
    exchange(&first, &bind(1, partition(), &token, None, 0));
    exchange(&second, &bind(1, partition(), &token, None, 0));

    let replies = exchange(&first, &upload(1, 1, vec![task(5, "write docs", false)]));
    let ServerMessage::Download {
        progress,
        changesets,
        ..
    } = &replies[0]
    else {
        panic!("expected acknowledgement, got {replies:?}");
    };
    assert_eq!(progress.last_integrated_client_version, 1);
    assert!(changesets.is_empty());

    let replies = exchange(&second, &ClientMessage::Ping { timestamp: 7 });
    let ServerMessage::Download { changesets, .. } = &replies[0] else {
        panic!("expected download, got {replies:?}");
    };
    assert_eq!(changesets[0].operations[0].key(), &PrimaryKeyValue::Int(5));
    assert_eq!(replies[1], ServerMessage::Pong { timestamp: 7 });

    // A resent changeset is not integrated twice.
    exchange(&first, &upload(1, 1, vec![task(5, "write docs", false)]));
    assert_eq!(server.version(Some("team")).unwrap(), 1);
    let title = server
        .read(Some("team"), |realm| {
            realm
                .find_with_primary_key("Task", 5)?
                .map(|task| task.get_value("title"))
                .transpose()
        })
        .unwrap();
    assert_eq!(title, Some(Value::String("write docs".into())));
}

#[test]
fn tokens_are_checked() {
    let (_dir, server) = start(|c| c);
    let connection = server.connect().unwrap();

    let replies = exchange(&connection, &bind(1, partition(), "not-a-token", None, 0));
    assert_eq!(error_of(&replies).code, ProtocolErrorCode::BadAuthentication.code());

    let expired = server.issue_token_at("alice", 0);
    let replies = exchange(&connection, &bind(2, partition(), &expired, None, 0));
    let error = error_of(&replies);
    assert_eq!(error.code, ProtocolErrorCode::TokenExpired.code());
    assert!(error.try_again);
}

#[test]
fn unknown_client_files_must_reset() {
    let (_dir, server) = start(|c| c);
    let token = server.issue_token("alice");
    let connection = server.connect().unwrap();
    let stranger = FileIdent { ident: 42, salt: 1 };
    let replies = exchange(&connection, &bind(1, partition(), &token, Some(stranger), 3));
    let error = error_of(&replies);
    assert_eq!(error.code, ProtocolErrorCode::BadClientFileIdent.code());
    assert_eq!(error.action, ServerRequestsAction::ClientReset);

    let replies = exchange(&connection, &bind(2, partition(), &token, None, 0));
    let ident = ident_of(&replies);
    let other = server.connect().unwrap();
    let replies = exchange(&other, &bind(1, partition(), &token, Some(ident), 9));
    assert_eq!(error_of(&replies).code, ProtocolErrorCode::BadServerVersion.code());

    server.reset_realm(Some("team")).unwrap();
    let replies = exchange(
        &connection,
        &ClientMessage::Mark {
            session: 2,
            request_ident: 1,
        },
    );
    assert_eq!(error_of(&replies).code, ProtocolErrorCode::BadClientFileIdent.code());
}

#[test]
fn flexible_sessions_follow_their_queries() {
    let (_dir, server) = start(|c| c);
    server
        .write(None, |realm| {
            realm.create_object_with_primary_key("Task", 1)?.set_value("done", false)?;
            realm.create_object_with_primary_key("Task", 2)?.set_value("done", true)?;
            Ok(())
        })
        .unwrap();
    let token = server.issue_token("alice");
    let connection = server.connect().unwrap();
    let mut message = bind(1, BindMode::Flexible, &token, None, 0);
    if let ClientMessage::Bind { query, .. } = &mut message {
        *query = Some((
            1,
            vec![QuerySpec {
                class: "Task".into(),
                query: "done == false".into(),
            }],
        ));
    }
    let replies = exchange(&connection, &message);
    let ServerMessage::Download {
        query_version,
        changesets,
        ..
    } = &replies[1]
    else {
        panic!("expected bootstrap, got {replies:?}");
    };
    assert_eq!(*query_version, 1);
    assert_eq!(changesets[0].operations.len(), 1);
    assert_eq!(changesets[0].operations[0].key(), &PrimaryKeyValue::Int(1));

    let replies = exchange(
        &connection,
        &ClientMessage::Query {
            session: 1,
            query_version: 2,
            queries: vec![QuerySpec {
                class: "Task".into(),
                query: "done == ".into(),
            }],
        },
    );
    assert!(matches!(
        replies[0],
        ServerMessage::QueryError {
            query_version: 2,
            ..
        }
    ));

    let replies = exchange(
        &connection,
        &ClientMessage::Query {
            session: 1,
            query_version: 3,
            queries: vec![QuerySpec {
                class: "Task".into(),
                query: "done == true".into(),
            }],
        },
    );
    let ServerMessage::Download { changesets, .. } = &replies[0] else {
        panic!("expected bootstrap, got {replies:?}");
    };
    assert_eq!(changesets[0].operations[0].key(), &PrimaryKeyValue::Int(2));

    // Task 3 would not match `done == true`, so the server reverts it.
    let replies = exchange(&connection, &upload(1, 1, vec![task(3, "sneaky", false)]));
    let error = error_of(&replies);
    assert_eq!(error.code, ProtocolErrorCode::CompensatingWrite.code());
    assert!(!error.is_fatal());
    assert_eq!(error.compensating_writes[0].primary_key, PrimaryKeyValue::Int(3));
    let corrective = replies
        .iter()
        .find_map(|m| match m {
            ServerMessage::Download { changesets, .. } if !changesets.is_empty() => Some(changesets),
            _ => None,
        })
        .unwrap();
    assert!(corrective[0].operations[0].is_erase());
    let exists = server
        .read(None, |realm| Ok(realm.find_with_primary_key("Task", 3)?.is_some()))
        .unwrap();
    assert!(!exists);
}

#[test]
fn read_only_classes_reject_writes() {
    let (_dir, server) = start(|c| c.with_read_only_class("Task"));
    let token = server.issue_token("alice");
    let connection = server.connect().unwrap();
    exchange(&connection, &bind(1, BindMode::Flexible, &token, None, 0));
    let replies = exchange(&connection, &upload(1, 1, vec![task(1, "nope", false)]));
    let error = error_of(&replies);
    assert_eq!(error.code, ProtocolErrorCode::CompensatingWrite.code());
    assert!(error.compensating_writes[0].reason.contains("read-only"));
}

#[test]
fn offline_server_refuses_everything() {
    let (_dir, server) = start(|c| c);
    let connection = server.connect().unwrap();
    server.set_offline(true).unwrap();
    assert!(matches!(server.connect(), Err(ServerError::Unavailable)));
    let ping = ClientMessage::Ping { timestamp: 1 }.encode().unwrap();
    assert!(matches!(connection.send(&ping), Err(ServerError::Unavailable)));
    server.set_offline(false).unwrap();
    assert_eq!(connection.send(&ping).unwrap().len(), 1);
}

#[test]
fn injected_errors_answer_the_next_message() {
    let (_dir, server) = start(|c| c);
    let token = server.issue_token("alice");
    let connection = server.connect().unwrap();
    exchange(&connection, &bind(1, partition(), &token, None, 0));
    server.inject_error(ProtocolErrorCode::OtherSessionError).unwrap();

    // Pings carry no session, so the error waits for the mark.
    let replies = exchange(&connection, &ClientMessage::Ping { timestamp: 1 });
    assert_eq!(replies, vec![ServerMessage::Pong { timestamp: 1 }]);
    let replies = exchange(
        &connection,
        &ClientMessage::Mark {
            session: 1,
            request_ident: 3,
        },
    );
    let error = error_of(&replies);
    assert_eq!(error.code, 201);
    assert_eq!(error.session, Some(1));
}

#[test]
fn stopped_server_fails_calls() {
    let (_dir, server) = start(|c| c);
    let connection = server.connect().unwrap();
    server.shutdown();
    let ping = ClientMessage::Ping { timestamp: 1 }.encode().unwrap();
    assert!(matches!(connection.send(&ping), Err(ServerError::Stopped)));
    assert!(matches!(server.set_offline(true), Err(ServerError::Stopped)));
}
