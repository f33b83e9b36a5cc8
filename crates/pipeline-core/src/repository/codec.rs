use super::{Document, Update};
use crate::domain::{start_timestamp, Entity, Uid};
use crate::error::{Error, Result};
use serde_json::{json, Map, Value};

const REV: &str = "rev";
const TIMESTAMP: &str = "timestamp";

fn codec_error<E: Entity>(uid: &Uid, source: serde_json::Error) -> Error {
    Error::Codec {
        collection: E::NAME.to_string(),
        uid: uid.clone(),
        source,
    }
}

pub(crate) fn decode<E: Entity>(doc: Document) -> Result<E> {
    let Document {
        id,
        ver,
        timestamp,
        mut fields,
    } = doc;

    fields.insert(REV.to_string(), json!({ "uid": id, "ver": ver }));
    let timestamp = serde_json::to_value(timestamp).map_err(|err| codec_error::<E>(&id, err))?;
    fields.insert(TIMESTAMP.to_string(), timestamp);

    serde_json::from_value(Value::Object(fields)).map_err(|err| codec_error::<E>(&id, err))
}

pub(crate) fn zero<E: Entity>(uid: &Uid) -> Result<E> {
    decode(Document {
        id: uid.clone(),
        ver: 0,
        timestamp: start_timestamp(),
        fields: Map::new(),
    })
}

pub(crate) fn encode<E: Entity>(entity: &E) -> Result<Update> {
    let uid = entity.uid();
    let mut fields = match serde_json::to_value(entity).map_err(|err| codec_error::<E>(uid, err))? {
        Value::Object(fields) => fields,
        other => {
            return Err(codec_error::<E>(
                uid,
                serde::ser::Error::custom(format!("expected an object, got {other}")),
            ))
        }
    };
    fields.remove(REV);
    fields.remove(TIMESTAMP);

    Ok(Update {
        collection: E::NAME,
        id: uid.clone(),
        expected_ver: entity.ver(),
        timestamp: entity.timestamp(),
        fields,
    })
}
