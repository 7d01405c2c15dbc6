//! Row ⇄ Parquet bridge: transposes JSON document rows into typed Arrow
//! columns and back. Row order and null-ability survive the round trip;
//! nested values ride in a JSON-text column tagged in the field metadata.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, AsArray, BinaryBuilder, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::datatypes::{
    DataType as ArrowType, Field as ArrowField, Float64Type, Int64Type, Schema as ArrowSchema,
};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;

use crate::error::{DlResult, Error};
use crate::schema::{DataType, Row, Schema};

/// Field-metadata key carrying the engine's logical type where Arrow's
/// physical type is ambiguous (JSON text vs. plain strings).
const LOGICAL_TYPE_KEY: &str = "doclake.type";

const PARQUET_MAGIC: &[u8] = b"PAR1";

/// Cheap corruption probe used by verified compaction.
pub(crate) fn looks_like_parquet(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && bytes.starts_with(PARQUET_MAGIC) && bytes.ends_with(PARQUET_MAGIC)
}

fn arrow_field(field: &crate::schema::Field) -> ArrowField {
    let (arrow_type, logical) = match field.data_type {
        DataType::Boolean => (ArrowType::Boolean, None),
        DataType::Long => (ArrowType::Int64, None),
        DataType::Double => (ArrowType::Float64, None),
        DataType::String => (ArrowType::Utf8, None),
        DataType::Binary => (ArrowType::Binary, None),
        DataType::Json => (ArrowType::Utf8, Some("json")),
    };
    let mut out = ArrowField::new(&field.name, arrow_type, field.nullable);
    if let Some(logical) = logical {
        out = out.with_metadata(HashMap::from([(
            LOGICAL_TYPE_KEY.to_string(),
            logical.to_string(),
        )]));
    }
    out
}

fn type_error(column: &str, expected: DataType, value: &Value) -> Error {
    Error::validation(format!(
        "column `{column}` expects {expected:?}, got incompatible value {value}"
    ))
}

fn build_column<R: Borrow<Row>>(field: &crate::schema::Field, rows: &[R]) -> DlResult<ArrayRef> {
    let name = field.name.as_str();
    let values = rows.iter().map(|row| row.borrow().get(name));
    Ok(match field.data_type {
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(Value::Bool(b)) => builder.append_value(*b),
                    Some(other) => return Err(type_error(name, field.data_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Long => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(Value::Number(n)) => match n.as_i64() {
                        Some(v) => builder.append_value(v),
                        None => {
                            return Err(type_error(name, field.data_type, &Value::Number(n.clone())))
                        }
                    },
                    Some(other) => return Err(type_error(name, field.data_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Double => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(Value::Number(n)) => match n.as_f64() {
                        Some(v) => builder.append_value(v),
                        None => {
                            return Err(type_error(name, field.data_type, &Value::Number(n.clone())))
                        }
                    },
                    Some(other) => return Err(type_error(name, field.data_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::String => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(Value::String(s)) => builder.append_value(s),
                    // Numbers (notably integers beyond i64) render as
                    // decimal strings; booleans as `true`/`false`.
                    Some(Value::Number(n)) => builder.append_value(n.to_string()),
                    Some(Value::Bool(b)) => builder.append_value(b.to_string()),
                    Some(other) => return Err(type_error(name, field.data_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Binary => {
            let mut builder = BinaryBuilder::new();
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(Value::Array(items)) => {
                        let mut buf = Vec::with_capacity(items.len());
                        for item in items {
                            match item.as_u64().filter(|b| *b <= u8::MAX as u64) {
                                Some(b) => buf.push(b as u8),
                                None => {
                                    return Err(type_error(
                                        name,
                                        field.data_type,
                                        &Value::Array(items.clone()),
                                    ))
                                }
                            }
                        }
                        builder.append_value(&buf);
                    }
                    Some(other) => return Err(type_error(name, field.data_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Json => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(other) => builder.append_value(serde_json::to_string(other)?),
                }
            }
            Arc::new(builder.finish())
        }
    })
}

/// Transpose `rows` into columns of `schema` and encode one Parquet file.
pub(crate) fn encode_rows<R: Borrow<Row>>(schema: &Schema, rows: &[R]) -> DlResult<Bytes> {
    if schema.is_empty() {
        return Err(Error::validation("cannot write rows without columns"));
    }
    let arrow_schema = Arc::new(ArrowSchema::new(
        schema.fields.iter().map(arrow_field).collect::<Vec<_>>(),
    ));
    let columns = schema
        .fields
        .iter()
        .map(|f| build_column(f, rows))
        .collect::<DlResult<Vec<_>>>()?;
    let batch = if rows.is_empty() {
        RecordBatch::new_empty(arrow_schema.clone())
    } else {
        RecordBatch::try_new(arrow_schema.clone(), columns)?
    };

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, arrow_schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Bytes::from(buf))
}

fn logical_type(field: &ArrowField) -> DlResult<DataType> {
    Ok(match field.data_type() {
        ArrowType::Boolean => DataType::Boolean,
        ArrowType::Int64 => DataType::Long,
        ArrowType::Float64 => DataType::Double,
        ArrowType::Binary => DataType::Binary,
        ArrowType::Utf8 => {
            if field.metadata().get(LOGICAL_TYPE_KEY).map(String::as_str) == Some("json") {
                DataType::Json
            } else {
                DataType::String
            }
        }
        other => {
            return Err(Error::validation(format!(
                "unsupported column type {other} in data file"
            )))
        }
    })
}

/// Decode one Parquet file back into rows, preserving row order and
/// materializing nulls for nullable columns.
pub(crate) fn decode_rows(bytes: Bytes) -> DlResult<Vec<Row>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let arrow_schema = batch.schema();
        let fields: Vec<(&ArrowField, DataType)> = arrow_schema
            .fields()
            .iter()
            .map(|f| logical_type(f).map(|dt| (f.as_ref(), dt)))
            .collect::<DlResult<Vec<_>>>()?;
        for i in 0..batch.num_rows() {
            let mut row = Row::new();
            for (col_idx, (field, data_type)) in fields.iter().enumerate() {
                let column = batch.column(col_idx);
                let value = if column.is_null(i) {
                    Value::Null
                } else {
                    match data_type {
                        DataType::Boolean => Value::Bool(column.as_boolean().value(i)),
                        DataType::Long => {
                            Value::from(column.as_primitive::<Int64Type>().value(i))
                        }
                        DataType::Double => {
                            let v = column.as_primitive::<Float64Type>().value(i);
                            serde_json::Number::from_f64(v)
                                .map(Value::Number)
                                .unwrap_or(Value::Null)
                        }
                        DataType::String => {
                            Value::String(column.as_string::<i32>().value(i).to_string())
                        }
                        DataType::Binary => Value::Array(
                            column
                                .as_binary::<i32>()
                                .value(i)
                                .iter()
                                .map(|b| Value::from(*b))
                                .collect(),
                        ),
                        DataType::Json => {
                            let text = column.as_string::<i32>().value(i);
                            serde_json::from_str(text)
                                .unwrap_or_else(|_| Value::String(text.to_string()))
                        }
                    }
                };
                row.insert(field.name().clone(), value);
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use serde_json::json;

    fn to_rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn round_trip_primitives() {
        let rows = to_rows(vec![
            json!({"id": "1", "name": "Alice", "value": 100, "score": 1.5, "ok": true}),
            json!({"id": "2", "name": "Bob", "value": 200, "score": 2.5, "ok": false}),
        ]);
        let schema = Schema::infer(&rows).unwrap();
        let bytes = encode_rows(&schema, &rows).unwrap();
        assert!(looks_like_parquet(&bytes));

        let back = decode_rows(bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0]["name"], json!("Alice"));
        assert_eq!(back[0]["value"], json!(100));
        assert_eq!(back[1]["score"], json!(2.5));
        assert_eq!(back[1]["ok"], json!(false));
    }

    #[test]
    fn round_trip_preserves_row_order_and_nulls() {
        let rows = to_rows(vec![
            json!({"k": "c", "v": 1}),
            json!({"k": "a"}),
            json!({"k": "b", "v": 3}),
        ]);
        let schema = Schema::infer(&rows).unwrap();
        let back = decode_rows(encode_rows(&schema, &rows).unwrap()).unwrap();
        let keys: Vec<_> = back.iter().map(|r| r["k"].clone()).collect();
        assert_eq!(keys, vec![json!("c"), json!("a"), json!("b")]);
        assert_eq!(back[1]["v"], Value::Null);
    }

    #[test]
    fn nested_values_round_trip_via_json_column() {
        let rows = to_rows(vec![
            json!({"id": 1, "payload": {"nested": [1, 2, 3]}, "tags": ["x", "y"]}),
        ]);
        let schema = Schema::infer(&rows).unwrap();
        let back = decode_rows(encode_rows(&schema, &rows).unwrap()).unwrap();
        assert_eq!(back[0]["payload"], json!({"nested": [1, 2, 3]}));
        assert_eq!(back[0]["tags"], json!(["x", "y"]));
    }

    #[test]
    fn big_integers_become_decimal_strings() {
        let big: u64 = (1 << 60) + 3;
        let rows = to_rows(vec![json!({"n": big}), json!({"n": 7})]);
        let schema = Schema::infer(&rows).unwrap();
        assert_eq!(schema.field("n").unwrap().data_type, DataType::String);
        let back = decode_rows(encode_rows(&schema, &rows).unwrap()).unwrap();
        assert_eq!(back[0]["n"], json!(big.to_string()));
        assert_eq!(back[1]["n"], json!("7"));
    }

    #[test]
    fn binary_columns_round_trip() {
        let schema = Schema::new(vec![Field::new("blob", DataType::Binary, true)]);
        let rows = to_rows(vec![json!({"blob": [0, 128, 255]}), json!({"blob": null})]);
        let back = decode_rows(encode_rows(&schema, &rows).unwrap()).unwrap();
        assert_eq!(back[0]["blob"], json!([0, 128, 255]));
        assert_eq!(back[1]["blob"], Value::Null);
    }

    #[test]
    fn type_mismatch_is_a_validation_error() {
        let schema = Schema::new(vec![Field::new("v", DataType::Long, false)]);
        let rows = to_rows(vec![json!({"v": "not a number"})]);
        assert!(matches!(
            encode_rows(&schema, &rows),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn empty_batch_round_trips_schema_only() {
        let schema = Schema::new(vec![Field::new("a", DataType::Long, true)]);
        let back = decode_rows(encode_rows::<Row>(&schema, &[]).unwrap()).unwrap();
        assert!(back.is_empty());
    }
}
