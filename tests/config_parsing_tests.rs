use webserv::config::{self, Method};

#[test]
fn parses_minimal_server_block() {
    let text = r#"
        server {
            listen 8080;
            host 127.0.0.1;
            root ./www;
        }
    "#;
    let config = config::parse(text).expect("should parse");
    assert_eq!(config.servers.len(), 1);
    let server = &config.servers[0];
    assert_eq!(server.port, 8080);
    assert_eq!(server.host, "127.0.0.1");
    assert_eq!(server.root, "./www");
}

#[test]
fn parses_locations_and_directives() {
    let text = r#"
        server {
            listen 8080;
            host 0.0.0.0;
            server_name example.com www.example.com;
            root ./www;
            index index.html index.htm;
            client_max_body_size 2m;
            error_page 404 /errors/404.html;

            location / {
                autoindex on;
            }

            location /cgi-bin {
                cgi_pass /usr/bin/python3;
                allowed_methods GET POST;
            }

            location /upload {
                upload_store ./uploads;
                client_max_body_size 10m;
            }

            location /old {
                return 301 /new;
            }
        }
    "#;
    let config = config::parse(text).expect("should parse");
    let server = &config.servers[0];
    assert_eq!(server.server_names, vec!["example.com", "www.example.com"]);
    assert_eq!(server.index, vec!["index.html", "index.htm"]);
    assert_eq!(server.client_max_body_size, Some(2 * 1024 * 1024));
    assert_eq!(server.error_pages.get(&404).unwrap(), "/errors/404.html");
    assert_eq!(server.locations.len(), 4);

    let cgi = server.locations.iter().find(|l| l.path == "/cgi-bin").unwrap();
    assert_eq!(cgi.cgi_pass.as_deref(), Some("/usr/bin/python3"));
    assert_eq!(cgi.allowed_methods.as_ref().unwrap(), &vec![Method::Get, Method::Post]);

    let upload = server.locations.iter().find(|l| l.path == "/upload").unwrap();
    assert_eq!(upload.upload_store.as_deref(), Some("./uploads"));
    assert_eq!(upload.client_max_body_size, Some(10 * 1024 * 1024));

    let old = server.locations.iter().find(|l| l.path == "/old").unwrap();
    let redirect = old.redirect.as_ref().unwrap();
    assert_eq!(redirect.code, 301);
    assert_eq!(redirect.target, "/new");
}

#[test]
fn rejects_unknown_directive() {
    let text = r#"
        server {
            listen 8080;
            frobnicate yes;
        }
    "#;
    let err = config::parse(text).unwrap_err();
    assert!(err.message.contains("unknown directive"));
}

#[test]
fn rejects_missing_semicolon() {
    let text = r#"
        server {
            listen 8080
        }
    "#;
    assert!(config::parse(text).is_err());
}

#[test]
fn rejects_empty_config() {
    assert!(config::parse("").is_err());
}

#[test]
fn location_prefix_must_start_with_slash() {
    let text = r#"
        server {
            listen 8080;
            location cgi-bin {
            }
        }
    "#;
    let err = config::parse(text).unwrap_err();
    assert!(err.message.contains("must begin with '/'"));
}

#[test]
fn error_page_accepts_multiple_codes_sharing_one_path() {
    let text = r#"
        server {
            listen 8080;
            error_page 500 502 503 /errors/5xx.html;
        }
    "#;
    let config = config::parse(text).expect("should parse");
    let server = &config.servers[0];
    assert_eq!(server.error_pages.get(&500).unwrap(), "/errors/5xx.html");
    assert_eq!(server.error_pages.get(&502).unwrap(), "/errors/5xx.html");
    assert_eq!(server.error_pages.get(&503).unwrap(), "/errors/5xx.html");
}

#[test]
fn validate_rejects_duplicate_server_names_on_same_bind() {
    let tmp = std::env::temp_dir();
    let root = tmp.to_str().unwrap().to_string();
    let text = format!(
        r#"
        server {{
            listen 8080;
            host 127.0.0.1;
            server_name example.com;
            root {root};
        }}
        server {{
            listen 8080;
            host 127.0.0.1;
            server_name example.com;
            root {root};
        }}
    "#
    );
    let config = config::parse(&text).expect("should parse");
    let errors = config::validate(&config).expect_err("duplicate server_name should fail validation");
    assert!(errors.iter().any(|e| e.contains("duplicate server_name")));
}

#[test]
fn validate_rejects_missing_root_directory() {
    let text = r#"
        server {
            listen 8080;
            root /no/such/directory/anywhere;
        }
    "#;
    let config = config::parse(text).expect("should parse");
    let errors = config::validate(&config).expect_err("missing root should fail validation");
    assert!(errors.iter().any(|e| e.contains("is not a directory")));
}

#[test]
fn group_by_bind_keeps_first_declared_as_default() {
    let tmp = std::env::temp_dir();
    let root = tmp.to_str().unwrap().to_string();
    let text = format!(
        r#"
        server {{
            listen 8080;
            host 127.0.0.1;
            server_name first.example.com;
            root {root};
        }}
        server {{
            listen 8080;
            host 127.0.0.1;
            server_name second.example.com;
            root {root};
        }}
    "#
    );
    let config = config::parse(&text).expect("should parse");
    let groups = config::group_by_bind(&config);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].servers.len(), 2);
    assert_eq!(groups[0].default_server().server_names[0], "first.example.com");
    assert!(config::validate(&config).is_ok());
}
