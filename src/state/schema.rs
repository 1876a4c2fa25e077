// @generated manually to match migrations/state.
diesel::table! {
    file_records (path) {
        path -> Text,
        server_file_id -> Nullable<Text>,
        server_version -> Nullable<BigInt>,
        content_hash -> Nullable<Text>,
        chunk_hashes -> Text,
        size -> BigInt,
        mtime -> BigInt,
        is_tracked -> Bool,
        updated_at -> BigInt,
    }
}

diesel::table! {
    upload_progress (path) {
        path -> Text,
        chunk_hashes -> Text,
        uploaded_hashes -> Text,
        updated_at -> BigInt,
    }
}

diesel::table! {
    change_cursor (id) {
        id -> Integer,
        cursor -> Nullable<Text>,
        updated_at -> BigInt,
    }
}
