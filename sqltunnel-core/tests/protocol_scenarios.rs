//! End-to-end scenarios driven through the public protocol service.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use futures::{stream, StreamExt};
use sqltunnel_core::config::{POOL_CONNECTION_TIMEOUT_KEY, POOL_MAX_SIZE_KEY};
use sqltunnel_core::protocol::wire_value::Kind;
use sqltunnel_core::protocol::{
    CallResourceRequest, CallTarget, CallType, ConnectRequest, FetchRequest, LobDataBlock,
    LobReference, LobType, ReadLobRequest, ResourceType, RowBlock, SessionInfo, StatementRequest,
    WireValue,
};
use sqltunnel_core::{ProtocolService, ServerConfig, ServerError};

fn ok<T>(result: Result<T, ServerError>) -> Result<T> {
    result.map_err(|err| anyhow!(err.to_string()))
}

fn service_with(config: ServerConfig) -> ProtocolService {
    ProtocolService::new(&ServerConfig {
        pool_min_idle: 0,
        ..config
    })
}

async fn connect_to(
    service: &ProtocolService,
    url: &str,
    client: &str,
    properties: HashMap<String, String>,
) -> Result<SessionInfo> {
    ok(service
        .connect(ConnectRequest {
            url: url.to_string(),
            user: "tester".to_string(),
            password: "secret".to_string(),
            client_uuid: client.to_string(),
            properties,
            datasource_name: String::new(),
        })
        .await)
}

fn statement(session: &SessionInfo, sql: &str) -> StatementRequest {
    StatementRequest {
        session: Some(session.clone()),
        sql: sql.to_string(),
        ..StatementRequest::default()
    }
}

fn fetch(session: &SessionInfo, result_set: &str) -> FetchRequest {
    FetchRequest {
        session: Some(session.clone()),
        result_set_uuid: result_set.to_string(),
        size: 0,
    }
}

/// Upload `chunks` as one LOB and return the final reference.
async fn upload(
    service: &ProtocolService,
    shell: &SessionInfo,
    lob_type: LobType,
    chunks: &[&[u8]],
) -> Result<LobReference> {
    let mut position = 1i64;
    let mut blocks = Vec::new();
    for (index, chunk) in chunks.iter().enumerate() {
        blocks.push(Ok(LobDataBlock {
            session: (index == 0).then(|| shell.clone()),
            lob_type: lob_type as i32,
            position,
            data: chunk.to_vec(),
            ..LobDataBlock::default()
        }));
        position += chunk.len() as i64;
    }
    let references: Vec<_> = ok(service.create_lob(stream::iter(blocks)).await)?
        .collect()
        .await;
    let last = references
        .into_iter()
        .last()
        .ok_or_else(|| anyhow!("upload produced no reference"))?;
    ok(last)
}

async fn download(service: &ProtocolService, reference: LobReference) -> Result<Vec<u8>> {
    let blocks: Vec<_> = ok(service
        .read_lob(ReadLobRequest {
            reference: Some(reference),
            position: 1,
            length: 0,
        })
        .await)?
    .collect()
    .await;
    let mut data = Vec::new();
    for block in blocks {
        data.extend(ok(block)?.data);
    }
    Ok(data)
}

fn first_block(result: &sqltunnel_core::protocol::OpResult) -> Result<&RowBlock> {
    result
        .rows
        .as_ref()
        .ok_or_else(|| anyhow!("query returned no row block"))
}

fn call(
    session: &SessionInfo,
    resource_type: ResourceType,
    call_type: CallType,
    name: &str,
    params: Vec<WireValue>,
) -> CallResourceRequest {
    CallResourceRequest {
        session: Some(session.clone()),
        resource_type: resource_type as i32,
        target: Some(CallTarget {
            call_type: call_type as i32,
            resource_name: name.to_string(),
            params,
            next_call: None,
        }),
        ..CallResourceRequest::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn generic_urls_report_upper_case_labels() -> Result<()> {
    let service = service_with(ServerConfig::default());
    let shell = connect_to(&service, "db://host/db", "c1", HashMap::new()).await?;
    ok(service
        .execute_update(statement(&shell, "CREATE TABLE t(id INT)"))
        .await)?;
    let inserted = ok(service
        .execute_update(statement(&shell, "INSERT INTO t VALUES (1)"))
        .await)?;
    assert_eq!(inserted.update_count, 1);

    let result = ok(service
        .execute_query(statement(&shell, "SELECT id FROM t"))
        .await)?;
    let block = first_block(&result)?;
    assert_eq!(block.labels, vec!["ID"]);
    assert_eq!(block.rows.len(), 1);
    assert!(matches!(block.rows[0].values[0].kind, Some(Kind::Int(1))));
    assert!(block.last);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_calls_without_a_session_hand_back_their_connection() -> Result<()> {
    let service = service_with(ServerConfig::default());
    let properties = HashMap::from([
        (POOL_MAX_SIZE_KEY.to_string(), "1".to_string()),
        (POOL_CONNECTION_TIMEOUT_KEY.to_string(), "2000".to_string()),
    ]);
    let shell = connect_to(&service, "duckdb::memory:", "c1", properties).await?;

    let mut unparsable = call(&shell, ResourceType::PreparedStatement, CallType::Execute, "Query", Vec::new());
    unparsable.sql = "SELEC broken".to_string();
    assert!(matches!(
        service.call_resource(unparsable).await,
        Err(ServerError::DuckDb(_))
    ));
    let wrong_type = LobDataBlock {
        session: Some(shell.clone()),
        lob_type: 99,
        position: 1,
        data: b"x".to_vec(),
        ..LobDataBlock::default()
    };
    assert!(matches!(
        service.create_lob(stream::iter(vec![Ok(wrong_type)])).await,
        Err(ServerError::InvalidRequest(_))
    ));
    assert_eq!(service.snapshot().sessions.total_sessions, 0);

    let result = ok(service.execute_query(statement(&shell, "SELECT 1")).await)?;
    assert_eq!(first_block(&result)?.rows.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn prepared_statements_run_through_calls_open_the_circuit() -> Result<()> {
    let service = service_with(ServerConfig {
        breaker_failure_threshold: 1,
        ..ServerConfig::default()
    });
    let shell = connect_to(&service, "duckdb::memory:", "c1", HashMap::new()).await?;
    let execute = || {
        let mut request = call(&shell, ResourceType::PreparedStatement, CallType::Execute, "Query", Vec::new());
        request.sql = "SELECT * FROM missing_tbl".to_string();
        request
    };

    assert!(matches!(
        service.call_resource(execute()).await,
        Err(ServerError::DuckDb(_))
    ));
    for _ in 0..2 {
        assert!(matches!(
            service.call_resource(execute()).await,
            Err(ServerError::CircuitOpen { .. })
        ));
    }
    let snapshot = service.snapshot();
    assert_eq!(snapshot.open_circuits.len(), 1);
    assert_eq!(snapshot.monitor.totals.errors, 1);
    assert!(service.sessions().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn clob_uploaded_in_two_blocks_binds_as_one_value() -> Result<()> {
    let service = service_with(ServerConfig::default());
    let shell = connect_to(&service, "duckdb::memory:", "c1", HashMap::new()).await?;
    ok(service
        .execute_update(statement(&shell, "CREATE TABLE docs(body VARCHAR)"))
        .await)?;

    let reference = upload(&service, &shell, LobType::Clob, &[b"AAAA".as_slice(), b"BBBB".as_slice()]).await?;
    let session = reference
        .session
        .clone()
        .ok_or_else(|| anyhow!("reference without a session"))?;
    assert!(session.has_session());

    let mut insert = statement(&session, "INSERT INTO docs VALUES (?)");
    insert.parameters = vec![WireValue::of(Kind::ClobRef(reference.lob_uuid.clone()))];
    let inserted = ok(service.execute_update(insert).await)?;
    assert_eq!(inserted.update_count, 1);

    let result = ok(service
        .execute_query(statement(&session, "SELECT body FROM docs"))
        .await)?;
    let block = first_block(&result)?;
    assert!(matches!(
        &block.rows[0].values[0].kind,
        Some(Kind::Text(text)) if text == "AAAABBBB"
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lob_bytes_survive_a_round_trip_at_block_boundaries() -> Result<()> {
    let block = 4usize;
    let service = service_with(ServerConfig {
        lob_block_size: block,
        ..ServerConfig::default()
    });
    let shell = connect_to(&service, "duckdb::memory:", "c1", HashMap::new()).await?;
    for size in [0, 1, block, block + 1, block * 3 + 2] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7 % 251) as u8).collect();
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&payload[..]]
        } else {
            payload.chunks(block).collect()
        };
        let reference = upload(&service, &shell, LobType::Blob, &chunks).await?;
        assert!(reference.complete);
        assert_eq!(reference.bytes_written, size as i64);
        assert_eq!(download(&service, reference).await?, payload, "size {size}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_engine_failures_open_the_circuit() -> Result<()> {
    let service = service_with(ServerConfig {
        breaker_failure_threshold: 2,
        ..ServerConfig::default()
    });
    let shell = connect_to(&service, "duckdb::memory:", "c1", HashMap::new()).await?;
    let broken = "SELECT * FROM no_such_table";
    for _ in 0..2 {
        assert!(matches!(
            service.execute_query(statement(&shell, broken)).await,
            Err(ServerError::DuckDb(_))
        ));
    }
    assert!(matches!(
        service.execute_query(statement(&shell, broken)).await,
        Err(ServerError::CircuitOpen { .. })
    ));
    ok(service.execute_query(statement(&shell, "SELECT 1")).await)?;
    assert_eq!(service.snapshot().open_circuits.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_pool_times_out_every_waiting_caller() -> Result<()> {
    let service = service_with(ServerConfig::default());
    let properties = HashMap::from([
        (POOL_MAX_SIZE_KEY.to_string(), "1".to_string()),
        (POOL_CONNECTION_TIMEOUT_KEY.to_string(), "100".to_string()),
    ]);
    let shell = connect_to(&service, "duckdb::memory:", "c1", properties).await?;
    let holder = ok(service.start_transaction(shell.clone()).await)?;

    let callers: Vec<_> = (0..10)
        .map(|_| {
            let service = service.clone();
            let request = statement(&shell, "SELECT 1");
            tokio::spawn(async move { service.execute_query(request).await })
        })
        .collect();
    for caller in callers {
        assert!(matches!(
            caller.await?,
            Err(ServerError::ConnectionTimeout { .. })
        ));
    }

    ok(service.commit_transaction(holder.clone()).await)?;
    assert!(service.terminate_session(&holder).terminated);
    let mut recovered = None;
    for _ in 0..50 {
        match service.execute_query(statement(&shell, "SELECT 1")).await {
            Ok(result) => {
                recovered = Some(result);
                break;
            }
            Err(ServerError::ConnectionTimeout { .. }) => {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await
            }
            Err(err) => return Err(anyhow!(err.to_string())),
        }
    }
    assert!(recovered.is_some(), "pool never released its connection");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_call_chains_into_column_count() -> Result<()> {
    let service = service_with(ServerConfig::default());
    let shell = connect_to(&service, "duckdb::memory:", "c1", HashMap::new()).await?;
    let mut query = statement(&shell, "SELECT range AS a, range * 2 AS b, 'x' AS c FROM range(3)");
    query
        .properties
        .insert("fetch_size".to_string(), "1".to_string());
    let result = ok(service.execute_query(query).await)?;
    let session = result
        .session
        .clone()
        .ok_or_else(|| anyhow!("no session shell"))?;
    let block = first_block(&result)?;
    assert!(session.has_session());
    assert!(!block.result_set_uuid.is_empty());

    let response = ok(service
        .call_resource(CallResourceRequest {
            session: Some(session),
            resource_type: ResourceType::ResultSet as i32,
            resource_uuid: block.result_set_uuid.clone(),
            target: Some(CallTarget {
                call_type: CallType::Get as i32,
                resource_name: "MetaData".to_string(),
                params: Vec::new(),
                next_call: Some(Box::new(CallTarget {
                    call_type: CallType::Get as i32,
                    resource_name: "ColumnCount".to_string(),
                    params: Vec::new(),
                    next_call: None,
                })),
            }),
            ..CallResourceRequest::default()
        })
        .await)?;
    assert!(matches!(response.values[0].kind, Some(Kind::Int(3))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_are_isolated_and_stale_after_termination() -> Result<()> {
    let service = service_with(ServerConfig::default());
    let shell_a = connect_to(&service, "duckdb::memory:", "client-a", HashMap::new()).await?;
    let shell_b = connect_to(&service, "duckdb::memory:", "client-b", HashMap::new()).await?;
    let session_a = ok(service.start_transaction(shell_a).await)?;
    let session_b = ok(service.start_transaction(shell_b).await)?;
    assert_ne!(session_a.session_uuid, session_b.session_uuid);

    let result = ok(service
        .execute_query(statement(&session_a, "SELECT * FROM range(5)"))
        .await)?;
    let result_set = first_block(&result)?.result_set_uuid.clone();
    assert!(!result_set.is_empty());

    assert!(matches!(
        service.fetch_next_rows(fetch(&session_b, &result_set)).await,
        Err(ServerError::ResourceNotFound { .. })
    ));

    assert!(service.terminate_session(&session_a).terminated);
    assert!(!service.terminate_session(&session_a).terminated);
    assert!(matches!(
        service.fetch_next_rows(fetch(&session_a, &result_set)).await,
        Err(ServerError::SessionNotFound(_))
    ));
    assert!(matches!(
        service.execute_query(statement(&session_a, "SELECT 1")).await,
        Err(ServerError::SessionNotFound(_))
    ));
    ok(service.execute_query(statement(&session_b, "SELECT 1")).await)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fetching_past_the_end_keeps_returning_empty_last_blocks() -> Result<()> {
    let service = service_with(ServerConfig::default());
    let shell = connect_to(&service, "duckdb::memory:", "c1", HashMap::new()).await?;
    let session = ok(service.start_transaction(shell).await)?;
    let result = ok(service
        .execute_query(statement(&session, "SELECT * FROM range(3)"))
        .await)?;
    let first = first_block(&result)?;
    assert_eq!(first.rows.len(), 3);
    assert!(first.last);

    for _ in 0..3 {
        let block = ok(service
            .fetch_next_rows(fetch(&session, &first.result_set_uuid))
            .await)?;
        assert!(block.rows.is_empty());
        assert!(block.last);
    }
    Ok(())
}
