diesel::table! {
    events (id) {
        id -> Integer,
        device_id -> Integer,
        event_type -> Integer,
        event_type_str -> Text,
        trap_count -> Nullable<Integer>,
        battery_voltage -> Nullable<Float>,
        route_hops -> Nullable<Integer>,
        device_timestamp -> Nullable<BigInt>,
        gateway_time -> Nullable<BigInt>,
        mac_address -> Nullable<Text>,
        received_at -> BigInt,
    }
}

diesel::table! {
    device_status (device_id) {
        device_id -> Integer,
        mac_address -> Nullable<Text>,
        last_seen -> BigInt,
        last_event_type -> Text,
        total_triggers -> Integer,
        battery_voltage -> Nullable<Float>,
        is_online -> Bool,
    }
}

diesel::table! {
    statistics (date) {
        date -> Text,
        total_triggers -> Integer,
    }
}

diesel::allow_tables_to_appear_in_same_query!(events, device_status, statistics);
