pub mod http_connect;
