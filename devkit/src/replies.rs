/*!
Builders for battery replies

Produces the JSON frames a Marstek battery sends back on the UDP API, so
tests describe device behaviour by intent instead of raw strings.
*/

use serde_json::{json, Value};

/// Builds reply frames and `result` bodies
pub struct ReplyBuilder;

impl ReplyBuilder {
    /// `result` body of an ES.GetMode answer
    pub fn es_get_mode(soc: i64, mode: &str, ongrid_power: i64, offgrid_power: i64) -> Value {
        json!({
            "id": 0,
            "mode": mode,
            "ongrid_power": ongrid_power,
            "offgrid_power": offgrid_power,
            "bat_soc": soc
        })
    }

    /// `{"id": .., "result": ..}`
    pub fn success(id: u64, result: Value) -> Value {
        json!({ "id": id, "result": result })
    }

    /// `{"id": .., "error": {"code": .., "message": ..}}`
    pub fn error(id: u64, code: i64, message: &str) -> Value {
        json!({ "id": id, "error": { "code": code, "message": message } })
    }

    /// JSON-RPC "method not found"
    pub fn method_not_found(id: u64) -> Value {
        Self::error(id, -32601, "Method not found")
    }
}
