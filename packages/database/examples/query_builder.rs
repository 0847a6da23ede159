//! Basic usage: derive a table, insert a few rows, query them back.

use lodestone_database::{
    Connection, CreateFlags, DbError, FieldDef, Model, Row, TableDescriptor, Value, ValueKind, col,
    val,
};

#[derive(Debug, Default)]
struct Artist {
    id: i32,
    name: String,
    formed: Option<i32>,
}

impl Model for Artist {
    fn table() -> TableDescriptor {
        TableDescriptor::new("artists")
            .field(FieldDef::new("Id", ValueKind::Int32))
            .field(FieldDef::new("Name", ValueKind::Text))
            .field(FieldDef::new("Formed", ValueKind::Int32))
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.name.as_str().into(), self.formed.into()]
    }

    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.try_get("Id")?,
            name: row.try_get("Name")?,
            formed: row.try_get("Formed")?,
        })
    }

    fn put_generated_key(&mut self, key: Value) {
        if let Value::Integer(id) = key {
            self.id = i32::try_from(id).unwrap_or_default();
        }
    }
}

fn main() -> Result<(), DbError> {
    let db = Connection::open_in_memory()?;
    db.create_table_with::<Artist>(CreateFlags::ALL_IMPLICIT | CreateFlags::AUTOINC_KEY)?;

    db.run_in_transaction(|tx| {
        for (name, formed) in [("Can", Some(1968)), ("Neu!", Some(1971)), ("Harmonia", None)] {
            tx.insert(&mut Artist {
                id: 0,
                name: name.to_string(),
                formed,
            })?;
        }
        Ok(())
    })?;

    let seventies = db
        .table::<Artist>()?
        .filter(col("Formed").ge(val(1970)))
        .order_by("Name")
        .to_vec()?;
    for artist in &seventies {
        println!("{} ({:?})", artist.name, artist.formed);
    }

    let unknown = db.table::<Artist>()?.filter(col("Formed").sql_eq(val(Value::Null))).count()?;
    println!("{unknown} artist(s) with unknown formation year");

    Ok(())
}
