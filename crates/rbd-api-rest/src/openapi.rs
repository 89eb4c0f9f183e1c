//! Generated API document (Swagger 2.0).
//!
//! Built once from the route table below and served as JSON for the docs UI.

use serde_json::{Map, Value, json};

/// Base path of the resource tree.
pub const BASE_PATH: &str = "/v1/rbd";

/// Response body shape of an operation.
#[derive(Debug, Clone, Copy)]
pub enum Body {
    /// A single definition
    One(&'static str),
    /// An array of a definition
    Many(&'static str),
    /// `{}`
    Empty,
}

/// One documented operation.
#[derive(Debug, Clone, Copy)]
pub struct RouteDoc {
    pub method: &'static str,
    /// Path below [`BASE_PATH`]
    pub path: &'static str,
    pub operation_id: &'static str,
    pub summary: &'static str,
    /// Request body definition
    pub request: Option<&'static str>,
    pub status: u16,
    pub response: Body,
    /// Whether the operation can answer 404
    pub not_found: bool,
}

pub const ROUTES: &[RouteDoc] = &[
    RouteDoc {
        method: "post",
        path: "/pools/{pool}/images",
        operation_id: "createImage",
        summary: "Create an image",
        request: Some("Image"),
        status: 201,
        response: Body::One("Image"),
        not_found: false,
    },
    RouteDoc {
        method: "get",
        path: "/pools/{pool}/images/{imageName}",
        operation_id: "getImage",
        summary: "Get an image with its size and QoS limits",
        request: None,
        status: 200,
        response: Body::One("Image"),
        not_found: true,
    },
    RouteDoc {
        method: "put",
        path: "/pools/{pool}/images/{imageName}",
        operation_id: "updateImage",
        summary: "Resize an image and/or set its QoS limits",
        request: Some("Image"),
        status: 200,
        response: Body::One("Image"),
        not_found: true,
    },
    RouteDoc {
        method: "delete",
        path: "/pools/{pool}/images/{imageName}",
        operation_id: "deleteImage",
        summary: "Delete an image",
        request: None,
        status: 200,
        response: Body::Empty,
        not_found: true,
    },
    RouteDoc {
        method: "get",
        path: "/pools/{pool}/images/",
        operation_id: "listImage",
        summary: "List the images in a pool",
        request: None,
        status: 200,
        response: Body::Many("Image"),
        not_found: false,
    },
    RouteDoc {
        method: "post",
        path: "/pools/{pool}/images/{imageName}/snapshots",
        operation_id: "createSnapshot",
        summary: "Create and protect a snapshot",
        request: Some("Snapshot"),
        status: 200,
        response: Body::One("Snapshot"),
        not_found: true,
    },
    RouteDoc {
        method: "get",
        path: "/pools/{pool}/images/{imageName}/snapshots/{snapshotName}",
        operation_id: "getSnapshot",
        summary: "Get a snapshot",
        request: None,
        status: 200,
        response: Body::One("Snapshot"),
        not_found: true,
    },
    RouteDoc {
        method: "get",
        path: "/pools/{pool}/images/{imageName}/snapshots/",
        operation_id: "listSnapshot",
        summary: "List the snapshots of an image",
        request: None,
        status: 200,
        response: Body::Many("Snapshot"),
        not_found: true,
    },
    RouteDoc {
        method: "post",
        path: "/pools/{pool}/images/{imageName}/snapshots/{snapshotName}/clone",
        operation_id: "createClone",
        summary: "Clone a new image from a protected snapshot",
        request: Some("Image"),
        status: 200,
        response: Body::One("Image"),
        not_found: true,
    },
];

/// Names of the `{...}` segments of a path, in order.
pub fn path_params(path: &str) -> Vec<&str> {
    path.split('/')
        .filter_map(|segment| segment.strip_prefix('{')?.strip_suffix('}'))
        .collect()
}

fn schema(body: Body) -> Value {
    match body {
        Body::One(name) => json!({ "$ref": format!("#/definitions/{name}") }),
        Body::Many(name) => json!({
            "type": "array",
            "items": { "$ref": format!("#/definitions/{name}") },
        }),
        Body::Empty => json!({ "type": "object" }),
    }
}

fn operation(route: &RouteDoc) -> Value {
    let mut parameters: Vec<Value> = path_params(route.path)
        .into_iter()
        .map(|name| {
            json!({
                "name": name,
                "in": "path",
                "required": true,
                "type": "string",
            })
        })
        .collect();
    if let Some(request) = route.request {
        parameters.push(json!({
            "name": "body",
            "in": "body",
            "required": true,
            "schema": schema(Body::One(request)),
        }));
    }

    let mut responses = Map::new();
    responses.insert(
        route.status.to_string(),
        json!({ "description": "OK", "schema": schema(route.response) }),
    );
    if route.request.is_some() {
        responses.insert("400".to_string(), json!({ "description": "Bad Request" }));
    }
    if route.not_found {
        responses.insert("404".to_string(), json!({ "description": "Not Found" }));
    }
    responses.insert(
        "500".to_string(),
        json!({ "description": "Internal Server Error" }),
    );

    json!({
        "operationId": route.operation_id,
        "summary": route.summary,
        "consumes": ["application/json"],
        "produces": ["application/json"],
        "parameters": parameters,
        "responses": responses,
    })
}

fn definitions() -> Value {
    json!({
        "Image": {
            "type": "object",
            "properties": {
                "pool": { "type": "string", "description": "Pool Name" },
                "name": { "type": "string", "description": "Image Name" },
                "size": { "type": "integer", "format": "int64", "description": "Image Size in GB" },
                "qos_bps": { "type": "integer", "format": "int64", "description": "Bandwidth Limit" },
                "qos_iops": { "type": "integer", "format": "int64", "description": "IOPS Limit" },
            },
        },
        "Snapshot": {
            "type": "object",
            "properties": {
                "pool": { "type": "string", "description": "Pool Name" },
                "image_name": { "type": "string", "description": "Image Name" },
                "name": { "type": "string", "description": "Snapshot Name" },
            },
        },
    })
}

/// Build the API document.
pub fn document() -> Value {
    let mut paths: Map<String, Value> = Map::new();
    for route in ROUTES {
        let entry = paths
            .entry(format!("{BASE_PATH}{}", route.path))
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(methods) = entry {
            methods.insert(route.method.to_string(), operation(route));
        }
    }

    json!({
        "swagger": "2.0",
        "info": {
            "title": "RBD API",
            "description": "Manage RBD images, snapshots and clones",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "basePath": "/",
        "schemes": ["http"],
        "paths": paths,
        "definitions": definitions(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_params() {
        assert_eq!(
            path_params("/pools/{pool}/images/{imageName}/snapshots/{snapshotName}/clone"),
            vec!["pool", "imageName", "snapshotName"]
        );
        assert!(path_params("/health").is_empty());
    }

    #[test]
    fn test_document_lists_every_operation() {
        let doc = document();
        assert_eq!(doc["swagger"], "2.0");

        let paths = doc["paths"].as_object().unwrap();
        let operations: usize = paths.values().map(|m| m.as_object().unwrap().len()).sum();
        assert_eq!(operations, ROUTES.len());
        assert_eq!(operations, 9);

        let image = &paths["/v1/rbd/pools/{pool}/images/{imageName}"];
        assert_eq!(image["get"]["operationId"], "getImage");
        assert_eq!(image["put"]["operationId"], "updateImage");
        assert_eq!(image["delete"]["operationId"], "deleteImage");
    }

    #[test]
    fn test_operation_parameters_and_responses() {
        let doc = document();
        let clone = &doc["paths"]
            ["/v1/rbd/pools/{pool}/images/{imageName}/snapshots/{snapshotName}/clone"]["post"];

        let params = clone["parameters"].as_array().unwrap();
        let names: Vec<&str> = params.iter().map(|p| p["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["pool", "imageName", "snapshotName", "body"]);
        assert_eq!(params[3]["schema"]["$ref"], "#/definitions/Image");

        assert!(clone["responses"]["200"].is_object());
        assert!(clone["responses"]["404"].is_object());
        assert!(clone["responses"]["400"].is_object());

        let create = &doc["paths"]["/v1/rbd/pools/{pool}/images"]["post"];
        assert!(create["responses"]["201"].is_object());
        assert!(create["responses"].get("404").is_none());
    }

    #[test]
    fn test_definitions() {
        let doc = document();
        let image = &doc["definitions"]["Image"]["properties"];
        assert_eq!(image["size"]["description"], "Image Size in GB");
        assert_eq!(image["qos_iops"]["type"], "integer");
        let snapshot = &doc["definitions"]["Snapshot"]["properties"];
        assert_eq!(snapshot["image_name"]["type"], "string");
    }
}
