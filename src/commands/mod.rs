/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `mcp` -- server listing, tool calls, resources, and prompts

Handlers are intentionally small and delegate to the library components:
the server registry and the aggregator.
*/

pub mod mcp;
