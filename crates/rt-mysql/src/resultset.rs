//! Result-set decoding: `ColumnCount -> Columns -> [EOF] -> Rows -> EOF/OK`,
//! for both the text protocol (`COM_QUERY`) and the binary protocol
//! (`COM_STMT_EXECUTE`).

use crate::error::MySqlError;
use crate::value::{Reader, Value};

pub const OK_PACKET_HEADER: u8 = 0x00;
pub const EOF_PACKET_HEADER: u8 = 0xFE;
pub const ERR_PACKET_HEADER: u8 = 0xFF;

#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_PACKET_HEADER) && payload.len() >= 7
}

pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_PACKET_HEADER) && payload.len() < 9
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_PACKET_HEADER)
}

pub fn parse_ok(payload: &[u8]) -> Result<OkPacket, MySqlError> {
    let mut r = Reader::new(payload);
    let _header = r.read_u8()?;
    let affected_rows = r.read_lenenc_int()?.unwrap_or(0);
    let last_insert_id = r.read_lenenc_int()?.unwrap_or(0);
    let status_flags = r.read_u16_le().unwrap_or(0);
    let warnings = r.read_u16_le().unwrap_or(0);
    let info = if r.remaining() > 0 {
        String::from_utf8_lossy(r.read_eof_string()).into_owned()
    } else {
        String::new()
    };
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

pub fn parse_err(payload: &[u8]) -> Result<ErrPacket, MySqlError> {
    let mut r = Reader::new(payload);
    let _header = r.read_u8()?;
    let code = r.read_u16_le()?;
    let sql_state = if r.peek_u8() == Some(b'#') {
        let _marker = r.read_u8()?;
        String::from_utf8_lossy(r.take(5)?).into_owned()
    } else {
        String::new()
    };
    let message = String::from_utf8_lossy(r.read_eof_string()).into_owned();
    Ok(ErrPacket {
        code,
        sql_state,
        message,
    })
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

pub fn parse_column_def(payload: &[u8]) -> Result<ColumnDef, MySqlError> {
    let mut r = Reader::new(payload);
    let _catalog = r.read_lenenc_bytes()?;
    let _schema = r.read_lenenc_bytes()?;
    let _table = r.read_lenenc_bytes()?;
    let _org_table = r.read_lenenc_bytes()?;
    let name = r
        .read_lenenc_string()?
        .ok_or_else(|| MySqlError::Protocol("column def missing name".into()))?;
    let _org_name = r.read_lenenc_bytes()?;
    let _fixed_len = r.read_lenenc_int()?;
    let _charset = r.read_u16_le()?;
    let _column_length = r.read_u32_le()?;
    let column_type = r.read_u8()?;
    let flags = r.read_u16_le()?;
    let decimals = r.read_u8()?;
    Ok(ColumnDef {
        name,
        column_type,
        flags,
        decimals,
    })
}

const TYPE_TINY: u8 = 0x01;
const TYPE_SHORT: u8 = 0x02;
const TYPE_LONG: u8 = 0x03;
const TYPE_FLOAT: u8 = 0x04;
const TYPE_DOUBLE: u8 = 0x05;
const TYPE_NULL: u8 = 0x06;
const TYPE_LONGLONG: u8 = 0x08;
const TYPE_INT24: u8 = 0x09;
const TYPE_DATE: u8 = 0x0A;
const TYPE_DATETIME: u8 = 0x0C;
const TYPE_YEAR: u8 = 0x0D;
const TYPE_NEWDATE: u8 = 0x0E;
const TYPE_TIMESTAMP: u8 = 0x07;
const UNSIGNED_FLAG: u16 = 0x0020;

/// Parses one row of the text protocol: every column is a length-encoded
/// string (or NULL), interpretation deferred to `Value::as_*`.
pub fn parse_text_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Value>, MySqlError> {
    let mut r = Reader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for col in columns {
        match r.read_lenenc_bytes()? {
            None => values.push(Value::Null),
            Some(bytes) => values.push(classify_text_value(col, bytes)),
        }
    }
    Ok(values)
}

fn classify_text_value(col: &ColumnDef, bytes: Vec<u8>) -> Value {
    let text = String::from_utf8_lossy(&bytes).into_owned();
    match col.column_type {
        TYPE_TINY | TYPE_SHORT | TYPE_LONG | TYPE_INT24 | TYPE_LONGLONG | TYPE_YEAR => {
            if col.flags & UNSIGNED_FLAG != 0 {
                text.parse::<u64>()
                    .map(Value::UInt)
                    .unwrap_or(Value::Bytes(bytes))
            } else {
                text.parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or(Value::Bytes(bytes))
            }
        }
        TYPE_FLOAT | TYPE_DOUBLE => text.parse::<f64>().map(Value::Float).unwrap_or(Value::Bytes(bytes)),
        TYPE_DATE | TYPE_DATETIME | TYPE_NEWDATE | TYPE_TIMESTAMP => Value::DateTime(text),
        TYPE_NULL => Value::Null,
        _ => Value::Bytes(bytes),
    }
}

/// Parses one row of the binary protocol (`COM_STMT_EXECUTE` results): a
/// leading 0x00 byte, a NULL bitmap (`(columns+7+2)/8` bytes, offset by 2),
/// then each non-null column encoded per its wire type.
pub fn parse_binary_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Value>, MySqlError> {
    let mut r = Reader::new(payload);
    let _header = r.read_u8()?;
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = r.take(bitmap_len)?;
    let is_null = |idx: usize| -> bool {
        let bit = idx + 2;
        (bitmap[bit / 8] >> (bit % 8)) & 1 == 1
    };
    let mut values = Vec::with_capacity(columns.len());
    for (idx, col) in columns.iter().enumerate() {
        if is_null(idx) {
            values.push(Value::Null);
            continue;
        }
        values.push(decode_binary_value(&mut r, col)?);
    }
    Ok(values)
}

fn decode_binary_value(r: &mut Reader<'_>, col: &ColumnDef) -> Result<Value, MySqlError> {
    let unsigned = col.flags & UNSIGNED_FLAG != 0;
    Ok(match col.column_type {
        TYPE_TINY => {
            let b = r.read_u8()?;
            if unsigned {
                Value::UInt(b as u64)
            } else {
                Value::Int(b as i8 as i64)
            }
        }
        TYPE_SHORT | TYPE_YEAR => {
            let v = r.read_u16_le()?;
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i16 as i64)
            }
        }
        TYPE_LONG | TYPE_INT24 => {
            let v = r.read_u32_le()?;
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i32 as i64)
            }
        }
        TYPE_LONGLONG => {
            let v = r.read_u64_le()?;
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        TYPE_FLOAT => {
            let bytes = r.take(4)?;
            Value::Float(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64)
        }
        TYPE_DOUBLE => {
            let bytes = r.take(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(bytes);
            Value::Float(f64::from_le_bytes(arr))
        }
        TYPE_DATE | TYPE_DATETIME | TYPE_NEWDATE | TYPE_TIMESTAMP => {
            Value::DateTime(decode_binary_datetime(r)?)
        }
        TYPE_NULL => Value::Null,
        _ => {
            let bytes = r
                .read_lenenc_bytes()?
                .ok_or_else(|| MySqlError::Protocol("unexpected NULL in non-null column".into()))?;
            Value::Bytes(bytes)
        }
    })
}

fn decode_binary_datetime(r: &mut Reader<'_>) -> Result<String, MySqlError> {
    let len = r.read_u8()?;
    if len == 0 {
        return Ok("0000-00-00 00:00:00".to_string());
    }
    let year = r.read_u16_le()?;
    let month = r.read_u8()?;
    let day = r.read_u8()?;
    if len == 4 {
        return Ok(format!("{year:04}-{month:02}-{day:02}"));
    }
    let hour = r.read_u8()?;
    let minute = r.read_u8()?;
    let second = r.read_u8()?;
    if len == 7 {
        return Ok(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
        ));
    }
    let micros = r.read_u32_le()?;
    Ok(format!(
        "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_col(unsigned: bool) -> ColumnDef {
        ColumnDef {
            name: "n".into(),
            column_type: TYPE_LONG,
            flags: if unsigned { UNSIGNED_FLAG } else { 0 },
            decimals: 0,
        }
    }

    #[test]
    fn ok_packet_roundtrip() {
        let mut payload = vec![0x00];
        crate::value::write_lenenc_int(&mut payload, 7);
        crate::value::write_lenenc_int(&mut payload, 42);
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        let ok = parse_ok(&payload).unwrap();
        assert_eq!(ok.affected_rows, 7);
        assert_eq!(ok.last_insert_id, 42);
    }

    #[test]
    fn text_row_parses_signed_and_unsigned_ints() {
        let columns = vec![int_col(false), int_col(true)];
        let mut payload = Vec::new();
        crate::value::write_lenenc_bytes(&mut payload, b"-5");
        crate::value::write_lenenc_bytes(&mut payload, b"5");
        let row = parse_text_row(&payload, &columns).unwrap();
        assert_eq!(row[0], Value::Int(-5));
        assert_eq!(row[1], Value::UInt(5));
    }

    #[test]
    fn binary_row_respects_null_bitmap_offset() {
        let columns = vec![int_col(false), int_col(false)];
        let mut payload = vec![0x00, 0b0000_0100];
        payload.extend_from_slice(&7i32.to_le_bytes());
        let row = parse_binary_row(&payload, &columns).unwrap();
        assert_eq!(row[0], Value::Null);
        assert_eq!(row[1], Value::Int(7));
    }

    #[test]
    fn err_packet_extracts_sql_state_and_message() {
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&1045u16.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(b"28000");
        payload.extend_from_slice(b"Access denied");
        let err = parse_err(&payload).unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.message, "Access denied");
    }
}
