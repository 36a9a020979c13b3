diesel::table! {
    inventory (sku_code, warehouse_id) {
        sku_code -> Varchar,
        warehouse_id -> Int8,
        quantity_on_hand -> Int4,
        allocated_quantity -> Int4,
        reserved_quantity -> Int4,
        reorder_minimum -> Int4,
        reorder_quantity -> Int4,
        restock_date -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    inventory_journal (id) {
        id -> Int8,
        sku_code -> Varchar,
        warehouse_id -> Int8,
        allocated_quantity_delta -> Int4,
        quantity_on_hand_delta -> Int4,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    inventory_journal_lock (sku_code, warehouse_id) {
        sku_code -> Varchar,
        warehouse_id -> Int8,
        lock_count -> Int8,
    }
}

diesel::table! {
    processed_commands (idempotency_key) {
        idempotency_key -> Varchar,
        command_id -> Uuid,
        result -> Nullable<Jsonb>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    inventory_journal,
    inventory_journal_lock,
    processed_commands,
);
