use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    chat_users (user_id) {
        user_id -> Text,
        name -> Text,
        email -> Text,
        role -> Text,
        photo_url -> Nullable<Text>,
        position -> Nullable<Text>,
        company_name -> Nullable<Text>,
        is_verified -> Bool,
        updated_at -> Timestamptz,
    }
}

table! {
    chat_conversations (id) {
        id -> Text,
        participant_low -> Text,
        participant_high -> Text,
        participant_details -> Jsonb,
        last_message -> Text,
        last_message_kind -> Nullable<Text>,
        last_message_at -> Timestamptz,
        last_message_sender -> Nullable<Text>,
        unread_low -> Integer,
        unread_high -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    chat_messages (id) {
        id -> BigInt,
        conversation_id -> Text,
        sender_id -> Text,
        sender_name -> Text,
        recipient_id -> Text,
        content -> Text,
        kind -> Text,
        attachment -> Nullable<Jsonb>,
        status -> Text,
        created_at -> Timestamptz,
        delivered_at -> Nullable<Timestamptz>,
        read_at -> Nullable<Timestamptz>,
    }
}

joinable!(chat_messages -> chat_conversations (conversation_id));

allow_tables_to_appear_in_same_query!(
    chat_users,
    chat_conversations,
    chat_messages,
);
