//! Item codec: domain items to wire attribute maps and back.
//!
//! The codec owns the inline-vs-overflow decision. It keeps a running
//! byte-length estimate while appending attributes; when the estimate
//! (including the payload) reaches the configured limit the payload is
//! omitted and the caller must place it in the overflow store under the
//! item's absolute hash.

use crate::error::CodecError;
use crate::types::{
    AbsoluteHash, AttrMap, AttrValue, Item, MAX_ATTRIBUTE_NAME_LEN, MIN_ATTRIBUTE_NAME_LEN,
};

// Reserved column names. All are two characters or fewer; caller attributes
// are constrained to 3-10 characters, so the namespaces cannot collide.
pub const COL_PARTITION_KEY: &str = "pk";
pub const COL_SORT_KEY: &str = "sk";
pub const COL_HASH: &str = "ah";
pub const COL_POD_ID: &str = "po";
pub const COL_PAYLOAD_TYPE: &str = "pt";
pub const COL_PURGE_DATE: &str = "ex";
pub const COL_CREATED_DATE: &str = "cd";
pub const COL_PAYLOAD: &str = "pl";
/// Latest sort key, present only on version-index mirror records.
pub const COL_LATEST_SORT_KEY: &str = "ls";

/// Service-prefixed partition key: `service_id` + separator + caller key.
/// The namespace is shared by every caller using the same service id.
pub fn scoped_partition_key(service_id: &str, partition_key: &str) -> String {
    format!(
        "{service_id}{}{partition_key}",
        crate::config::SERVICE_KEY_SEPARATOR
    )
}

/// An item rendered for the wire, in both shapes a write may need.
#[derive(Debug, Clone)]
pub struct EncodedItem {
    /// Full attribute map, the insert shape.
    pub put: AttrMap,
    /// Non-key attribute map, the conditional-update shape, used when the
    /// item's primary key is unchanged between versions. Excludes the
    /// created-date column so the original insertion timestamp survives.
    pub delta: AttrMap,
    /// Payload was omitted; the caller must write it to the overflow store
    /// before (or atomically with) the commit.
    pub overflowed: bool,
    /// Final size estimate, including the payload when inline.
    pub estimated_size: usize,
}

/// Append one attribute, growing the running size estimate by the column
/// name length plus the value's wire size.
fn append(attrs: &mut AttrMap, size: &mut usize, name: &str, value: AttrValue) {
    *size += name.len() + value.byte_size();
    attrs.insert(name.to_string(), value);
}

/// Encode an item into its wire shapes.
///
/// `scoped_pk` is the service-prefixed partition key; `created` is the
/// record creation time in epoch seconds (preserved from the original
/// insert on updates).
pub fn encode(
    item: &Item,
    scoped_pk: &str,
    payload_limit: usize,
    created: u64,
) -> Result<EncodedItem, CodecError> {
    for name in item.additional.keys() {
        let len = name.len();
        if !(MIN_ATTRIBUTE_NAME_LEN..=MAX_ATTRIBUTE_NAME_LEN).contains(&len) {
            return Err(CodecError::AttributeNameLength {
                name: name.clone(),
                len,
            });
        }
    }

    let mut put = AttrMap::new();
    let mut size = 0usize;

    append(&mut put, &mut size, COL_PARTITION_KEY, AttrValue::Str(scoped_pk.to_string()));
    append(&mut put, &mut size, COL_SORT_KEY, AttrValue::Str(item.sort_key.clone()));
    append(&mut put, &mut size, COL_HASH, AttrValue::Str(item.absolute_hash.to_string()));
    append(
        &mut put,
        &mut size,
        COL_POD_ID,
        item.pod_id.map_or(AttrValue::Null, |p| AttrValue::Num(p as f64)),
    );
    append(&mut put, &mut size, COL_PAYLOAD_TYPE, AttrValue::Str(item.payload_type.clone()));
    append(
        &mut put,
        &mut size,
        COL_PURGE_DATE,
        item.purge_date.map_or(AttrValue::Null, |e| AttrValue::Num(e as f64)),
    );
    append(&mut put, &mut size, COL_CREATED_DATE, AttrValue::Num(created as f64));

    for (name, value) in &item.additional {
        append(&mut put, &mut size, name, value.clone());
    }

    // Payload decision: inline only when the final estimate stays below the
    // limit. An item arriving without an inline payload is already
    // overflowed.
    let overflowed = match &item.payload {
        Some(payload) => size + COL_PAYLOAD.len() + payload.len() >= payload_limit,
        None => true,
    };
    if overflowed {
        append(&mut put, &mut size, COL_PAYLOAD, AttrValue::Null);
    } else if let Some(payload) = &item.payload {
        append(&mut put, &mut size, COL_PAYLOAD, AttrValue::Str(payload.clone()));
    }

    let mut delta = put.clone();
    delta.remove(COL_PARTITION_KEY);
    delta.remove(COL_SORT_KEY);
    delta.remove(COL_CREATED_DATE);

    Ok(EncodedItem {
        put,
        delta,
        overflowed,
        estimated_size: size,
    })
}

fn required<'a>(attrs: &'a AttrMap, col: &'static str) -> Result<&'a AttrValue, CodecError> {
    attrs.get(col).ok_or(CodecError::MissingColumn(col))
}

fn required_str<'a>(attrs: &'a AttrMap, col: &'static str) -> Result<&'a str, CodecError> {
    required(attrs, col)?
        .as_str()
        .ok_or_else(|| CodecError::ColumnType { col: col.to_string() })
}

/// Optional numeric column: `Null` and absence both read as `None`.
fn optional_num(attrs: &AttrMap, col: &str) -> Result<Option<f64>, CodecError> {
    match attrs.get(col) {
        None | Some(AttrValue::Null) => Ok(None),
        Some(AttrValue::Num(n)) => Ok(Some(*n)),
        Some(_) => Err(CodecError::ColumnType { col: col.to_string() }),
    }
}

/// Decode a stored attribute map back into an item.
///
/// Strips the service prefix from the partition key; a record whose key does
/// not carry the prefix belongs to another service and is rejected. The
/// returned payload is `None` when the record overflowed; the caller
/// resolves it through the overflow port using the absolute hash.
pub fn decode(attrs: &AttrMap, service_id: &str) -> Result<Item, CodecError> {
    let scoped_pk = required_str(attrs, COL_PARTITION_KEY)?;
    let prefix = format!("{service_id}{}", crate::config::SERVICE_KEY_SEPARATOR);
    let partition_key = scoped_pk
        .strip_prefix(&prefix)
        .ok_or_else(|| CodecError::ForeignPartitionKey(scoped_pk.to_string()))?
        .to_string();

    let sort_key = required_str(attrs, COL_SORT_KEY)?.to_string();

    let hash_hex = required_str(attrs, COL_HASH)?;
    let absolute_hash = AbsoluteHash::parse(hash_hex)
        .ok_or_else(|| CodecError::MalformedHash(hash_hex.to_string()))?;

    let payload = match attrs.get(COL_PAYLOAD) {
        None | Some(AttrValue::Null) => None,
        Some(AttrValue::Str(s)) => Some(s.clone()),
        Some(_) => {
            return Err(CodecError::ColumnType {
                col: COL_PAYLOAD.to_string(),
            });
        }
    };

    let pod_id = optional_num(attrs, COL_POD_ID)?.map(|n| n as i64);
    let payload_type = required_str(attrs, COL_PAYLOAD_TYPE)?.to_string();
    // Zero means "never expires", matching backend expiry semantics.
    let purge_date = optional_num(attrs, COL_PURGE_DATE)?
        .filter(|e| *e != 0.0)
        .map(|e| e as u64);

    let additional: AttrMap = attrs
        .iter()
        .filter(|(name, _)| {
            (MIN_ATTRIBUTE_NAME_LEN..=MAX_ATTRIBUTE_NAME_LEN).contains(&name.len())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok(Item {
        partition_key,
        sort_key,
        absolute_hash,
        payload,
        pod_id,
        payload_type,
        purge_date,
        additional,
    })
}
