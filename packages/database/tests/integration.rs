use lodestone_database::{
    Connection, CreateFlags, DbError, FieldDef, Model, Row, TableDescriptor, Value, ValueKind, col,
    val,
};
use pretty_assertions::assert_eq;

#[derive(Debug, Clone, PartialEq, Default)]
struct Invoice {
    id: i32,
    customer_id: i32,
    total_cents: i64,
    note: Option<String>,
}

impl Model for Invoice {
    fn table() -> TableDescriptor {
        TableDescriptor::new("invoices")
            .field(FieldDef::new("Id", ValueKind::Int32))
            .field(FieldDef::new("CustomerId", ValueKind::Int32))
            .field(FieldDef::new("TotalCents", ValueKind::Int64))
            .field(FieldDef::new("Note", ValueKind::Text))
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.customer_id.into(),
            self.total_cents.into(),
            self.note.clone().into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.try_get("Id")?,
            customer_id: row.try_get("CustomerId")?,
            total_cents: row.try_get("TotalCents")?,
            note: row.try_get("Note")?,
        })
    }

    fn put_generated_key(&mut self, key: Value) {
        if let Value::Integer(id) = key {
            self.id = i32::try_from(id).unwrap_or_default();
        }
    }
}

fn open_db() -> Connection {
    let db = Connection::open_in_memory().expect("in-memory database");
    db.create_table_with::<Invoice>(CreateFlags::ALL_IMPLICIT | CreateFlags::AUTOINC_KEY)
        .expect("create invoices");
    db
}

fn invoice(customer_id: i32, total_cents: i64, note: Option<&str>) -> Invoice {
    Invoice {
        id: 0,
        customer_id,
        total_cents,
        note: note.map(ToString::to_string),
    }
}

#[test]
fn full_crud_and_query_flow() {
    let db = open_db();

    let mut invoices = vec![
        invoice(1, 1200, Some("net 30")),
        invoice(1, 560, None),
        invoice(2, 90_000, Some("annual")),
    ];
    assert_eq!(db.insert_all(&mut invoices).unwrap(), 3);

    // Null comparison goes through the IS rewrite, not `=`.
    let unnoted = db
        .table::<Invoice>()
        .unwrap()
        .filter(col("Note").sql_eq(val(Value::Null)))
        .to_vec()
        .unwrap();
    assert_eq!(unnoted.len(), 1);
    assert_eq!(unnoted[0].total_cents, 560);

    let first_customer_total: i64 = db
        .table::<Invoice>()
        .unwrap()
        .filter(col("CustomerId").sql_eq(val(1)))
        .to_vec()
        .unwrap()
        .iter()
        .map(|i| i.total_cents)
        .sum();
    assert_eq!(first_customer_total, 1760);

    let mut updated = invoices[1].clone();
    updated.note = Some("paid".to_string());
    db.update(&updated).unwrap();
    let reloaded: Invoice = db.get(updated.id).unwrap();
    assert_eq!(reloaded.note.as_deref(), Some("paid"));

    db.delete(&invoices[2]).unwrap();
    assert_eq!(db.table::<Invoice>().unwrap().count().unwrap(), 2);
}

#[test]
fn implicit_index_for_customer_id_exists_exactly_once() {
    let db = open_db();
    let count = db
        .query_scalar::<i64>(
            "select count(*) from sqlite_master \
             where type='index' and name='invoices_CustomerId'",
            &[],
        )
        .unwrap();
    assert_eq!(count, Some(1));

    let unique = db
        .query_scalar::<i64>(
            "select count(*) from sqlite_master \
             where type='index' and name='invoices_CustomerId' \
             and sql like '%unique%'",
            &[],
        )
        .unwrap();
    assert_eq!(unique, Some(0), "the implicit index must not be unique");
}

#[test]
fn failed_transaction_leaves_no_partial_state() {
    let db = open_db();

    let result: Result<(), DbError> = db.run_in_transaction(|tx| {
        tx.insert(&mut invoice(7, 100, None))?;
        tx.insert(&mut invoice(7, 200, None))?;
        Err(DbError::NoRow)
    });
    assert!(result.is_err());

    assert_eq!(db.table::<Invoice>().unwrap().count().unwrap(), 0);

    // The connection is healthy afterwards.
    db.insert(&mut invoice(7, 300, None)).unwrap();
    assert_eq!(db.table::<Invoice>().unwrap().count().unwrap(), 1);
}

#[test]
fn savepoints_nest_across_the_facade() {
    let db = open_db();

    db.begin_transaction().unwrap();
    db.insert(&mut invoice(1, 10, None)).unwrap();

    let checkpoint = db.save_point().unwrap();
    db.insert(&mut invoice(1, 20, None)).unwrap();
    db.rollback_to(&checkpoint).unwrap();

    db.commit().unwrap();

    let totals: Vec<i64> = db
        .table::<Invoice>()
        .unwrap()
        .to_vec()
        .unwrap()
        .iter()
        .map(|i| i.total_cents)
        .collect();
    assert_eq!(totals, vec![10]);
}

#[test]
fn additive_migration_backfills_new_columns() {
    #[derive(Debug)]
    struct InvoiceV2;

    impl Model for InvoiceV2 {
        fn table() -> TableDescriptor {
            TableDescriptor::new("invoices")
                .field(FieldDef::new("Id", ValueKind::Int32))
                .field(FieldDef::new("CustomerId", ValueKind::Int32))
                .field(FieldDef::new("TotalCents", ValueKind::Int64))
                .field(FieldDef::new("Note", ValueKind::Text))
                .field(FieldDef::new("Currency", ValueKind::Text).max_length(3))
        }

        fn to_values(&self) -> Vec<Value> {
            Vec::new()
        }

        fn from_row(_row: &Row) -> Result<Self, DbError> {
            Ok(Self)
        }
    }

    let db = open_db();
    db.insert(&mut invoice(5, 1500, None)).unwrap();

    let changes = db
        .create_table_with::<InvoiceV2>(CreateFlags::ALL_IMPLICIT | CreateFlags::AUTOINC_KEY)
        .unwrap();
    assert_eq!(changes, 1, "exactly the new column is added");

    // Existing rows survive with the new column reading as NULL.
    let rows = db
        .query_rows("select \"Currency\" from \"invoices\"", &[])
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("Currency"), Some(Value::Null));
}
