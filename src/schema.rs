//! Handwritten Diesel schema declarations used by model structs.
//!
//! Migrations define the actual tables and constraints. This module only
//! provides `diesel::table!` declarations so we can derive Insertable/Queryable
//! in a type-safe way without running `diesel print-schema`.

diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    sites (id) {
        id -> Uuid,
        name -> Text,
        owner_id -> Nullable<Uuid>,
        address_line1 -> Nullable<Text>,
        address_line2 -> Nullable<Text>,
        zip_code -> Nullable<Text>,
        city -> Nullable<Text>,
        state -> Nullable<Text>,
        country -> Nullable<Text>,
        subdomain -> Nullable<Text>,
        created_at -> Timestamptz,
        modified_at -> Timestamptz,
    }
}

diesel::table! {
    hydroponic_systems (id) {
        id -> Uuid,
        site_id -> Uuid,
        name -> Nullable<Text>,
        system_type -> Text, // VT | FD | NFT | DWC
        created_at -> Timestamptz,
        modified_at -> Timestamptz,
    }
}

// site_id carries a UNIQUE constraint: one coordinator per site.
diesel::table! {
    coordinators (id) {
        id -> Uuid,
        site_id -> Nullable<Uuid>,
        local_ip_address -> Text,
        external_ip_address -> Text,
        channel_name -> Text,
        user_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        modified_at -> Timestamptz,
    }
}

diesel::table! {
    controllers (id) {
        id -> Uuid,
        name -> Nullable<Text>,
        coordinator_id -> Nullable<Uuid>,
        site_id -> Nullable<Uuid>,
        wifi_mac_address -> Text,
        external_ip_address -> Text,
        controller_type -> Text, // PUM | DOS | CAM | SEN | UNK
        channel_name -> Text,
        created_at -> Timestamptz,
        modified_at -> Timestamptz,
    }
}

diesel::table! {
    controller_tokens (key) {
        key -> Text,
        controller_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    peripherals (id) {
        id -> Uuid,
        controller_id -> Uuid,
        name -> Text,
        peripheral_type -> Text,
        config -> Jsonb,
        created_at -> Timestamptz,
        modified_at -> Timestamptz,
    }
}

// The composite primary key is the (instant, origin) uniqueness constraint.
diesel::table! {
    controller_messages (created_at, controller_id) {
        created_at -> Timestamptz,
        controller_id -> Uuid,
        kind -> Text, // cmd | tel | reg | err
        message -> Jsonb,
    }
}

diesel::table! {
    mqtt_messages (created_at, coordinator_id) {
        created_at -> Timestamptz,
        coordinator_id -> Uuid,
        message -> Jsonb,
        controller_id -> Nullable<Uuid>,
        topic_prefix -> Text, // cmd | tel | reg
        topic_suffix -> Text,
    }
}

diesel::table! {
    data_point_types (id) {
        id -> Uuid,
        name -> Text,
        unit -> Text,
    }
}

// Primary key on time alone; uniqueness is global across peripherals.
diesel::table! {
    data_points (time) {
        time -> Timestamptz,
        peripheral_id -> Uuid,
        data_point_type_id -> Uuid,
        value -> Double,
    }
}

diesel::table! {
    task_results (task_id) {
        task_id -> Text,
        status -> Text,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(sites -> users (owner_id));
diesel::joinable!(hydroponic_systems -> sites (site_id));
diesel::joinable!(coordinators -> sites (site_id));
diesel::joinable!(coordinators -> users (user_id));
diesel::joinable!(controllers -> coordinators (coordinator_id));
diesel::joinable!(controllers -> sites (site_id));
diesel::joinable!(controller_tokens -> controllers (controller_id));
diesel::joinable!(peripherals -> controllers (controller_id));
diesel::joinable!(controller_messages -> controllers (controller_id));
diesel::joinable!(mqtt_messages -> coordinators (coordinator_id));
diesel::joinable!(mqtt_messages -> controllers (controller_id));
diesel::joinable!(data_points -> peripherals (peripheral_id));
diesel::joinable!(data_points -> data_point_types (data_point_type_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    sites,
    hydroponic_systems,
    coordinators,
    controllers,
    controller_tokens,
    peripherals,
    controller_messages,
    mqtt_messages,
    data_point_types,
    data_points,
    task_results,
);
