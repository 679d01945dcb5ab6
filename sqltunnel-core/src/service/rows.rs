use std::sync::Arc;

use tracing::debug;

use crate::engine::cells::{binary_len, binary_value, decode_cell, is_binary, Cell};
use crate::error::ServerError;
use crate::lob::LobResource;
use crate::protocol::{wire_value::Kind, Row, RowBlock, WireValue};
use crate::session::{ResultSetResource, Session};
use crate::value::ParameterValue;

/// One encoded block and the number of LOB handles it registered.
pub(super) struct EncodedBlock {
    pub block: RowBlock,
    pub lob_handles: usize,
}

/// Encode the next page of `result_set`.
///
/// Drivers without cursor look-ahead get one row per block. Binary cells
/// above `inline_threshold` become Blob handles when the driver kind moves
/// binary data as LOBs. Fragile drivers get the bytes copied out first and
/// the handle outlives the result set; otherwise the handle reads the cell
/// in place and is released when the result set closes.
pub(super) fn encode_block(
    session: &Session,
    result_set: &ResultSetResource,
    size: usize,
    with_labels: bool,
    inline_threshold: usize,
) -> Result<EncodedBlock, ServerError> {
    let capabilities = session.capabilities();
    let page = result_set.next_page(capabilities.block_size(size))?;
    let columns = result_set.column_count();
    let mut rows = Vec::with_capacity(page.len());
    let mut lob_handles = 0usize;

    for row in page.clone() {
        let mut values = Vec::with_capacity(columns);
        for column in 0..columns {
            let (array, index) = result_set.cell(row, column)?;
            let large_binary = is_binary(array.data_type())
                && capabilities.binary_as_lob
                && binary_len(&array, index).is_some_and(|len| len > inline_threshold);
            if large_binary {
                let id = if capabilities.requires_eager_lob_hydration {
                    let bytes = binary_value(&array, index).unwrap_or_default();
                    session
                        .resources()
                        .register_lob(Arc::new(LobResource::from_bytes(bytes)))
                } else {
                    session.resources().register_result_lob(
                        result_set.id(),
                        Arc::new(LobResource::from_cell(array, index)),
                    )
                };
                lob_handles += 1;
                values.push(ParameterValue::BlobRef(id).to_wire());
                continue;
            }
            values.push(match decode_cell(&array, index)? {
                Cell::Value(value) => value.to_wire(),
                Cell::Binary(bytes) => WireValue::of(Kind::Bytes(bytes)),
            });
        }
        rows.push(Row { values });
    }

    let last = result_set.is_exhausted();
    debug!(
        result_set_id = %result_set.id(),
        rows = rows.len(),
        row_offset = page.start,
        last,
        lob_handles,
        "encoded row block"
    );
    Ok(EncodedBlock {
        block: RowBlock {
            labels: if with_labels {
                result_set.metadata().labels()
            } else {
                Vec::new()
            },
            rows,
            result_set_uuid: result_set.id().to_string(),
            last,
            row_offset: page.start as i64,
        },
        lob_handles,
    })
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::service::tests::{connect, test_service};

    fn kinds(block: &RowBlock) -> Vec<Option<Kind>> {
        block
            .rows
            .iter()
            .flat_map(|row| row.values.iter().map(|value| value.kind.clone()))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_binary_cells_become_blob_handles() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let lease = service.lease(&shell).await.map_err(|e| anyhow!(e.to_string()))?;
        let session = lease.session();
        let result = session
            .execute_query("SELECT '\\xAA'::BLOB AS small, repeat('x', 64)::BLOB AS big", &[])
            .map_err(|e| anyhow!(e.to_string()))?;
        let result_set = ResultSetResource::new(result, None, &session.capabilities(), 0);

        let encoded = encode_block(session, &result_set, 10, true, 16)
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(encoded.lob_handles, 1);
        assert_eq!(encoded.block.labels, vec!["small", "big"]);
        assert!(encoded.block.last);
        let cells = kinds(&encoded.block);
        assert!(matches!(&cells[0], Some(Kind::Bytes(bytes)) if bytes.len() == 1));
        let Some(Kind::BlobRef(handle)) = &cells[1] else {
            return Err(anyhow!("expected a blob handle, got {:?}", cells[1]));
        };
        let lob = session
            .resources()
            .lob(&crate::session::ResourceId::parse(handle).map_err(|e| anyhow!(e.to_string()))?)
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(lob.length(), Some(64));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_result_set_yields_empty_terminal_blocks() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let lease = service.lease(&shell).await.map_err(|e| anyhow!(e.to_string()))?;
        let session = lease.session();
        let result = session
            .execute_query("SELECT * FROM range(5)", &[])
            .map_err(|e| anyhow!(e.to_string()))?;
        let result_set = ResultSetResource::new(result, None, &session.capabilities(), 0);

        let first = encode_block(session, &result_set, 3, true, 0)
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(first.block.rows.len(), 3);
        assert!(!first.block.last);
        let second = encode_block(session, &result_set, 3, false, 0)
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(second.block.rows.len(), 2);
        assert_eq!(second.block.row_offset, 3);
        assert!(second.block.labels.is_empty());
        assert!(second.block.last);
        for _ in 0..2 {
            let again = encode_block(session, &result_set, 3, false, 0)
                .map_err(|e| anyhow!(e.to_string()))?;
            assert!(again.block.rows.is_empty());
            assert!(again.block.last);
        }
        Ok(())
    }
}
