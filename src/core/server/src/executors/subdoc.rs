// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Single-path sub-document operations: lookups and mutations addressed into
//! a JSON document by a dotted path with array subscripts (`a.b[2].c`).
//! Multi-path and array operations are advertised in the dispatch table but
//! answer not-supported.

use super::require_engine;
use crate::connection::Connection;

use bytes::Bytes;
use engine::{EngineError, Item, StoreSemantics};
use protocol_mcbp::{
    datatype, packet_extras, packet_key, packet_value, RequestHeader, Status,
};

use serde_json::Value;

use std::sync::Arc;

/// Create intermediate dictionary entries on the path.
const SUBDOC_FLAG_MKDIR_P: u8 = 0x01;

struct SubdocRequest {
    key: Vec<u8>,
    path: String,
    payload: Vec<u8>,
    flags: u8,
}

enum PathSegment {
    Field(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, Status> {
    let mut segments = Vec::new();

    for part in path.split('.') {
        if part.is_empty() {
            return Err(Status::SubdocPathEinval);
        }
        let mut rest = part;
        // field name before any subscripts
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(PathSegment::Field(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(Status::SubdocPathEinval);
                }
                let close = rest.find(']').ok_or(Status::SubdocPathEinval)?;
                let index: usize = rest[1..close]
                    .parse()
                    .map_err(|_| Status::SubdocPathEinval)?;
                segments.push(PathSegment::Index(index));
                rest = &rest[close + 1..];
            }
        } else {
            segments.push(PathSegment::Field(rest.to_string()));
        }
    }

    if segments.is_empty() {
        return Err(Status::SubdocPathEinval);
    }
    Ok(segments)
}

fn lookup<'a>(doc: &'a Value, segments: &[PathSegment]) -> Result<&'a Value, Status> {
    let mut current = doc;
    for segment in segments {
        current = match segment {
            PathSegment::Field(name) => match current {
                Value::Object(map) => map.get(name).ok_or(Status::SubdocPathEnoent)?,
                _ => return Err(Status::SubdocPathMismatch),
            },
            PathSegment::Index(index) => match current {
                Value::Array(items) => items.get(*index).ok_or(Status::SubdocPathEnoent)?,
                _ => return Err(Status::SubdocPathMismatch),
            },
        };
    }
    Ok(current)
}

/// Walk to the parent of the path's final segment, optionally creating
/// intermediate dictionaries.
fn lookup_parent<'a>(
    doc: &'a mut Value,
    segments: &[PathSegment],
    create: bool,
) -> Result<&'a mut Value, Status> {
    let mut current = doc;
    for segment in &segments[..segments.len() - 1] {
        current = match segment {
            PathSegment::Field(name) => match current {
                Value::Object(map) => {
                    if create && !map.contains_key(name) {
                        map.insert(name.clone(), Value::Object(serde_json::Map::new()));
                    }
                    map.get_mut(name).ok_or(Status::SubdocPathEnoent)?
                }
                _ => return Err(Status::SubdocPathMismatch),
            },
            PathSegment::Index(index) => match current {
                Value::Array(items) => items.get_mut(*index).ok_or(Status::SubdocPathEnoent)?,
                _ => return Err(Status::SubdocPathMismatch),
            },
        };
    }
    Ok(current)
}

fn parse_request(conn: &Connection, header: &RequestHeader) -> Result<SubdocRequest, EngineError> {
    // extras: pathlen(2) flags(1), mutations may append expiry(4)
    if header.extlen != 3 && header.extlen != 7 {
        return Err(EngineError::InvalidArguments);
    }
    if header.keylen == 0 {
        return Err(EngineError::InvalidArguments);
    }

    let packet = conn.packet();
    let extras = packet_extras(header, packet);
    let pathlen = u16::from_be_bytes([extras[0], extras[1]]) as usize;
    let flags = extras[2];

    let body = packet_value(header, packet);
    if body.len() < pathlen {
        return Err(EngineError::InvalidArguments);
    }

    Ok(SubdocRequest {
        key: packet_key(header, packet).to_vec(),
        path: String::from_utf8_lossy(&body[..pathlen]).into_owned(),
        payload: body[pathlen..].to_vec(),
        flags,
    })
}

fn respond_status(conn: &mut Connection, status: Status) {
    match conn.remap_error(status) {
        Some(status) => conn.send_response_status(status),
        None => conn.set_state(crate::State::Closing),
    }
}

fn fetch_document(
    conn: &mut Connection,
    engine: &Arc<dyn engine::Engine>,
    key: &[u8],
    vbucket: u16,
) -> Option<(Value, Item)> {
    let item = match engine.get(&conn.engine_cookie(), key, vbucket) {
        Ok(item) => item,
        Err(e) => {
            conn.respond_engine_error(e);
            return None;
        }
    };

    match serde_json::from_slice::<Value>(&item.value) {
        Ok(doc) => Some((doc, item)),
        Err(_) => {
            respond_status(conn, Status::SubdocDocNotJson);
            None
        }
    }
}

fn lookup_impl(conn: &mut Connection, op: LookupOp) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let request = match parse_request(conn, &header) {
        Ok(request) => request,
        Err(e) => {
            conn.respond_engine_error(e);
            return;
        }
    };
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let segments = match parse_path(&request.path) {
        Ok(segments) => segments,
        Err(status) => {
            respond_status(conn, status);
            return;
        }
    };

    let (doc, item) = match fetch_document(conn, &engine, &request.key, header.vbucket) {
        Some(found) => found,
        None => return,
    };

    match lookup(&doc, &segments) {
        Ok(value) => {
            let body = match op {
                LookupOp::Get => value.to_string().into_bytes(),
                LookupOp::Exists => Vec::new(),
                LookupOp::Count => {
                    let count = match value {
                        Value::Array(items) => items.len(),
                        Value::Object(map) => map.len(),
                        _ => {
                            respond_status(conn, Status::SubdocPathMismatch);
                            return;
                        }
                    };
                    count.to_string().into_bytes()
                }
            };
            conn.send_response(
                Status::Success,
                &[],
                &[],
                &body,
                if body.is_empty() {
                    datatype::RAW
                } else {
                    datatype::JSON
                },
                item.cas,
            );
        }
        Err(status) => respond_status(conn, status),
    }
}

enum LookupOp {
    Get,
    Exists,
    Count,
}

pub fn get_executor(conn: &mut Connection) {
    lookup_impl(conn, LookupOp::Get);
}

pub fn exists_executor(conn: &mut Connection) {
    lookup_impl(conn, LookupOp::Exists);
}

pub fn get_count_executor(conn: &mut Connection) {
    lookup_impl(conn, LookupOp::Count);
}

enum MutationOp {
    DictAdd,
    DictUpsert,
    Delete,
    Replace,
    Counter,
}

fn mutate_impl(conn: &mut Connection, op: MutationOp) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let request = match parse_request(conn, &header) {
        Ok(request) => request,
        Err(e) => {
            conn.respond_engine_error(e);
            return;
        }
    };
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let segments = match parse_path(&request.path) {
        Ok(segments) => segments,
        Err(status) => {
            respond_status(conn, status);
            return;
        }
    };

    let (mut doc, item) = match fetch_document(conn, &engine, &request.key, header.vbucket) {
        Some(found) => found,
        None => return,
    };

    // the response value, for operations which return one
    let mut response_body = Vec::new();

    {
        let create = request.flags & SUBDOC_FLAG_MKDIR_P != 0;
        let parent = match lookup_parent(&mut doc, &segments, create) {
            Ok(parent) => parent,
            Err(status) => {
                respond_status(conn, status);
                return;
            }
        };

        let last = segments.last().expect("path has at least one segment");

        match op {
            MutationOp::DictAdd | MutationOp::DictUpsert | MutationOp::Replace => {
                let new_value: Value = match serde_json::from_slice(&request.payload) {
                    Ok(value) => value,
                    Err(_) => {
                        respond_status(conn, Status::SubdocValueCantinsert);
                        return;
                    }
                };
                match (last, parent) {
                    (PathSegment::Field(name), Value::Object(map)) => {
                        let exists = map.contains_key(name);
                        match op {
                            MutationOp::DictAdd if exists => {
                                respond_status(conn, Status::SubdocPathEexists);
                                return;
                            }
                            MutationOp::Replace if !exists => {
                                respond_status(conn, Status::SubdocPathEnoent);
                                return;
                            }
                            _ => {}
                        }
                        map.insert(name.clone(), new_value);
                    }
                    (PathSegment::Index(index), Value::Array(items)) => {
                        match items.get_mut(*index) {
                            Some(slot) => *slot = new_value,
                            None => {
                                respond_status(conn, Status::SubdocPathEnoent);
                                return;
                            }
                        }
                    }
                    _ => {
                        respond_status(conn, Status::SubdocPathMismatch);
                        return;
                    }
                }
            }
            MutationOp::Delete => match (last, parent) {
                (PathSegment::Field(name), Value::Object(map)) => {
                    if map.remove(name).is_none() {
                        respond_status(conn, Status::SubdocPathEnoent);
                        return;
                    }
                }
                (PathSegment::Index(index), Value::Array(items)) => {
                    if *index >= items.len() {
                        respond_status(conn, Status::SubdocPathEnoent);
                        return;
                    }
                    items.remove(*index);
                }
                _ => {
                    respond_status(conn, Status::SubdocPathMismatch);
                    return;
                }
            },
            MutationOp::Counter => {
                let delta: i64 = match std::str::from_utf8(&request.payload)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                {
                    Some(delta) => delta,
                    None => {
                        respond_status(conn, Status::SubdocDeltaEinval);
                        return;
                    }
                };
                let slot = match (last, parent) {
                    (PathSegment::Field(name), Value::Object(map)) => {
                        if !map.contains_key(name) {
                            map.insert(name.clone(), Value::from(0));
                        }
                        map.get_mut(name).expect("inserted above")
                    }
                    (PathSegment::Index(index), Value::Array(items)) => {
                        match items.get_mut(*index) {
                            Some(slot) => slot,
                            None => {
                                respond_status(conn, Status::SubdocPathEnoent);
                                return;
                            }
                        }
                    }
                    _ => {
                        respond_status(conn, Status::SubdocPathMismatch);
                        return;
                    }
                };
                let current = match slot.as_i64() {
                    Some(current) => current,
                    None => {
                        respond_status(conn, Status::SubdocPathMismatch);
                        return;
                    }
                };
                let updated = match current.checked_add(delta) {
                    Some(updated) => updated,
                    None => {
                        respond_status(conn, Status::SubdocNumErange);
                        return;
                    }
                };
                *slot = Value::from(updated);
                response_body = updated.to_string().into_bytes();
            }
        }
    }

    let updated = Item::new(
        Bytes::from(doc.to_string()),
        item.flags,
        datatype::JSON,
        item.expiry,
    );

    match engine.store(
        &conn.engine_cookie(),
        &request.key,
        header.vbucket,
        updated,
        header.cas,
        StoreSemantics::Set,
    ) {
        Ok(result) => {
            let extras = if conn.features.mutation_seqno {
                let mut extras = Vec::with_capacity(16);
                extras.extend_from_slice(&result.vbucket_uuid.to_be_bytes());
                extras.extend_from_slice(&result.seqno.to_be_bytes());
                extras
            } else {
                Vec::new()
            };
            let dt = if response_body.is_empty() {
                datatype::RAW
            } else {
                datatype::JSON
            };
            conn.send_response(
                Status::Success,
                &extras,
                &[],
                &response_body,
                dt,
                result.cas,
            );
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn dict_add_executor(conn: &mut Connection) {
    mutate_impl(conn, MutationOp::DictAdd);
}

pub fn dict_upsert_executor(conn: &mut Connection) {
    mutate_impl(conn, MutationOp::DictUpsert);
}

pub fn delete_executor(conn: &mut Connection) {
    mutate_impl(conn, MutationOp::Delete);
}

pub fn replace_executor(conn: &mut Connection) {
    mutate_impl(conn, MutationOp::Replace);
}

pub fn counter_executor(conn: &mut Connection) {
    mutate_impl(conn, MutationOp::Counter);
}

/// Multi-path and array operations are not part of this core.
pub fn unsupported_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }
    conn.respond_engine_error(EngineError::NotSupported);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        assert!(matches!(
            parse_path("a").unwrap().as_slice(),
            [PathSegment::Field(_)]
        ));

        let segments = parse_path("a.b[2].c").unwrap();
        assert_eq!(segments.len(), 4);
        assert!(matches!(segments[1], PathSegment::Field(_)));
        assert!(matches!(segments[2], PathSegment::Index(2)));

        assert!(parse_path("").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[x]").is_err());
    }

    #[test]
    fn lookup_paths() {
        let doc: Value =
            serde_json::from_str(r#"{"a":{"b":[1,2,{"c":"hit"}]},"n":7}"#).unwrap();

        let segments = parse_path("a.b[2].c").unwrap();
        assert_eq!(lookup(&doc, &segments).unwrap(), &serde_json::json!("hit"));

        let segments = parse_path("n").unwrap();
        assert_eq!(lookup(&doc, &segments).unwrap(), &serde_json::json!(7));

        let segments = parse_path("a.missing").unwrap();
        assert_eq!(lookup(&doc, &segments), Err(Status::SubdocPathEnoent));

        let segments = parse_path("n.b").unwrap();
        assert_eq!(lookup(&doc, &segments), Err(Status::SubdocPathMismatch));

        let segments = parse_path("a.b[9]").unwrap();
        assert_eq!(lookup(&doc, &segments), Err(Status::SubdocPathEnoent));
    }

    #[test]
    fn parent_creation() {
        let mut doc: Value = serde_json::from_str(r#"{}"#).unwrap();
        let segments = parse_path("a.b.c").unwrap();

        assert_eq!(
            lookup_parent(&mut doc, &segments, false).err(),
            Some(Status::SubdocPathEnoent)
        );

        let parent = lookup_parent(&mut doc, &segments, true).unwrap();
        assert!(parent.is_object());
        assert_eq!(doc.pointer("/a/b").map(|v| v.is_object()), Some(true));
    }
}
